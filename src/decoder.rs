//! Streaming XML page decoder
//!
//! Drives a push-down state machine over the event stream of one dump file,
//! publishing each qualifying article as an [`EvolvingPage`] followed by a
//! lazily produced revision stream. Nothing larger than one revision is ever
//! buffered, so memory stays flat no matter how large the file is.
//!
//! A page must contain, in order, exactly one `<title>`, exactly one `<id>`
//! and zero or more `<revision>` subtrees. Any deviation fails the whole
//! file; there is no local recovery.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, PageContext};
use crate::lookup::{BotTable, TopicTable};
use crate::revert::RevertDetector;
use crate::types::{EvolvingPage, Revision, ANONYMOUS_USER_ID};

/// Timestamp layout used by the dump, always UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Shared dependencies of every per-file decoder.
#[derive(Clone)]
pub struct DecoderEnv {
    pub topics: Arc<TopicTable>,
    pub bots: Arc<BotTable>,
    /// Shared output channel all concurrent decoders write into.
    pub pages: mpsc::Sender<EvolvingPage>,
    pub cancel: CancellationToken,
    /// Capacity of each per-page revision channel.
    pub revision_buffer_size: usize,
}

/// Decoder state. Each transition consumes the current state and returns the
/// next one; dropping a `Setted` state closes its revision channel, which
/// keeps the single-closer rule intact on every error path.
enum State {
    /// Outside any page.
    Base,
    /// A `<page>` is open, no title seen yet.
    Started,
    /// Title decoded, waiting for the page id.
    Titled { title: String },
    /// Page announced downstream; decoding its revisions.
    Setted {
        revisions: mpsc::Sender<Revision>,
        detector: RevertDetector,
    },
}

/// Decode one dump file, publishing every qualifying article on the shared
/// page channel. The revision channel of each published page is closed by
/// this decoder exactly once: after the page's last revision, or when the
/// page is abandoned due to an error or cancellation.
pub async fn decode_stream<R>(
    reader: R,
    name: Option<PathBuf>,
    env: &DecoderEnv,
) -> Result<(), IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut xml = Reader::from_reader(reader);
    let mut ctx = PageContext::new(name);
    let mut state = State::Base;
    let mut buf = Vec::with_capacity(64 * 1024);

    loop {
        buf.clear();
        let event = match xml.read_event_into_async(&mut buf).await {
            Ok(event) => event,
            Err(e) => return Err(stream_error(e, &ctx)),
        };
        match event {
            Event::Start(ref start) => {
                let tag = start.name().as_ref().to_vec();
                match tag.as_slice() {
                    b"page" => {
                        if env.cancel.is_cancelled() {
                            return Err(IngestError::Cancelled {
                                context: ctx.clone(),
                            });
                        }
                        state = open_page(state, &ctx)?;
                    }
                    b"title" => state = set_title(state, &mut xml, &mut ctx).await?,
                    b"id" => state = set_page_id(state, &mut xml, env, &mut ctx).await?,
                    b"revision" => state = add_revision(state, &mut xml, env, &ctx).await?,
                    _ => {
                        // unknown siblings before the title are skipped as
                        // whole subtrees; elsewhere unknown elements are
                        // ignored token-wise
                        if matches!(state, State::Started) {
                            let mut skip = Vec::new();
                            xml.read_to_end_into_async(QName(&tag), &mut skip)
                                .await
                                .map_err(|e| stream_error(e, &ctx))?;
                        }
                    }
                }
            }
            Event::End(ref end) if end.name().as_ref() == b"page" => {
                state = close_page(state, &ctx)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(())
}

fn open_page(state: State, ctx: &PageContext) -> Result<State, IngestError> {
    match state {
        State::Base => Ok(State::Started),
        State::Started | State::Titled { .. } | State::Setted { .. } => {
            Err(invalid(ctx, "found nested element page"))
        }
    }
}

async fn set_title<R>(
    state: State,
    xml: &mut Reader<R>,
    ctx: &mut PageContext,
) -> Result<State, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    match state {
        State::Base => Err(invalid(ctx, "obligatory element page missing before title")),
        State::Started => {
            let title = read_element_text(xml, b"title", ctx).await?;
            ctx.last_title = title.clone();
            Ok(State::Titled { title })
        }
        State::Titled { .. } | State::Setted { .. } => {
            Err(invalid(ctx, "found a page with two titles"))
        }
    }
}

async fn set_page_id<R>(
    state: State,
    xml: &mut Reader<R>,
    env: &DecoderEnv,
    ctx: &mut PageContext,
) -> Result<State, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    match state {
        State::Base => Err(invalid(ctx, "obligatory element page missing before id")),
        State::Started => Err(invalid(ctx, "obligatory element title missing before id")),
        State::Titled { title } => {
            let raw = read_element_text(xml, b"id", ctx).await?;
            let page_id = parse_u32(&raw, "page id", ctx)?;

            let Some(topic_id) = env.topics.topic_of(page_id) else {
                // not an article: consume the rest of the page subtree so the
                // stream is positioned at the next page
                let mut skip = Vec::new();
                xml.read_to_end_into_async(QName(b"page"), &mut skip)
                    .await
                    .map_err(|e| stream_error(e, ctx))?;
                return Ok(State::Base);
            };

            let (revisions, receiver) = mpsc::channel(env.revision_buffer_size);
            let page = EvolvingPage {
                page_id,
                title,
                abstract_text: String::new(),
                topic_id,
                revisions: receiver,
            };
            tokio::select! {
                _ = env.cancel.cancelled() => Err(IngestError::Cancelled {
                    context: ctx.clone(),
                }),
                sent = env.pages.send(page) => {
                    if sent.is_err() {
                        // downstream hung up without cancelling
                        Err(IngestError::Cancelled { context: ctx.clone() })
                    } else {
                        Ok(State::Setted {
                            revisions,
                            detector: RevertDetector::new(),
                        })
                    }
                }
            }
        }
        State::Setted { .. } => Err(invalid(ctx, "found a page with two ids")),
    }
}

async fn add_revision<R>(
    state: State,
    xml: &mut Reader<R>,
    env: &DecoderEnv,
    ctx: &PageContext,
) -> Result<State, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    match state {
        State::Base => Err(invalid(ctx, "obligatory element page missing before revision")),
        State::Started => Err(invalid(ctx, "obligatory element title missing before revision")),
        State::Titled { .. } => Err(invalid(
            ctx,
            "found a page revision without a preceding page id",
        )),
        State::Setted {
            revisions,
            mut detector,
        } => {
            let raw = read_raw_revision(xml, ctx).await?;

            let timestamp_text = raw.timestamp.unwrap_or_default();
            let timestamp = NaiveDateTime::parse_from_str(&timestamp_text, TIMESTAMP_FORMAT)
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
                .map_err(|_| IngestError::Decode {
                    what: "revision timestamp",
                    value: timestamp_text.clone(),
                    context: ctx.clone(),
                })?;

            let sha1 = raw.sha1.unwrap_or_default();
            let is_revert = detector.observe(&sha1);
            let user_id = raw.user_id.unwrap_or(ANONYMOUS_USER_ID);
            let revision = Revision {
                id: raw.id.unwrap_or_default(),
                user_id,
                is_bot: env.bots.is_bot(user_id),
                text: raw.text.unwrap_or_default(),
                sha1,
                is_revert,
                timestamp,
            };

            tokio::select! {
                _ = env.cancel.cancelled() => Err(IngestError::Cancelled {
                    context: ctx.clone(),
                }),
                sent = revisions.send(revision) => {
                    if sent.is_err() {
                        Err(IngestError::Cancelled { context: ctx.clone() })
                    } else {
                        Ok(State::Setted { revisions, detector })
                    }
                }
            }
        }
    }
}

fn close_page(state: State, ctx: &PageContext) -> Result<State, IngestError> {
    match state {
        State::Base => Err(invalid(ctx, "page end without a page start")),
        State::Started => Err(invalid(ctx, "obligatory element title missing before page end")),
        State::Titled { .. } => Err(invalid(ctx, "page end without a page id")),
        // dropping the sender closes the revision stream
        State::Setted { .. } => Ok(State::Base),
    }
}

/// Raw fields of one `<revision>` subtree. Absent fields fall back to zero
/// values, except the timestamp which is obligatory.
#[derive(Debug, Default)]
struct RawRevision {
    id: Option<u32>,
    timestamp: Option<String>,
    user_id: Option<u32>,
    text: Option<String>,
    sha1: Option<String>,
}

async fn read_raw_revision<R>(
    xml: &mut Reader<R>,
    ctx: &PageContext,
) -> Result<RawRevision, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = RawRevision::default();
    let mut buf = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();

    loop {
        buf.clear();
        match xml
            .read_event_into_async(&mut buf)
            .await
            .map_err(|e| stream_error(e, ctx))?
        {
            Event::Start(e) => {
                path.push(e.name().as_ref().to_vec());
                text.clear();
            }
            Event::Empty(e) => {
                // <text/> carries an empty revision body
                if e.name().as_ref() == b"text" {
                    raw.text = Some(String::new());
                }
            }
            Event::Text(t) => text.push_str(&t.unescape().map_err(|e| stream_error(e, ctx))?),
            Event::CData(d) => text.push_str(&String::from_utf8_lossy(&d.into_inner())),
            Event::End(e) => {
                if e.name().as_ref() == b"revision" && path.is_empty() {
                    break;
                }
                let Some(top) = path.pop() else { continue };
                match (path.as_slice(), top.as_slice()) {
                    ([], b"id") => raw.id = Some(parse_u32(&text, "revision id", ctx)?),
                    ([], b"timestamp") => raw.timestamp = Some(std::mem::take(&mut text)),
                    ([], b"text") => raw.text = Some(std::mem::take(&mut text)),
                    ([], b"sha1") => raw.sha1 = Some(std::mem::take(&mut text)),
                    ([parent], b"id") if parent.as_slice() == b"contributor" => {
                        raw.user_id = Some(parse_u32(&text, "contributor id", ctx)?);
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => return Err(invalid(ctx, "unexpected end of file inside revision")),
            _ => {}
        }
    }

    Ok(raw)
}

async fn read_element_text<R>(
    xml: &mut Reader<R>,
    end: &[u8],
    ctx: &PageContext,
) -> Result<String, IngestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut out = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match xml
            .read_event_into_async(&mut buf)
            .await
            .map_err(|e| stream_error(e, ctx))?
        {
            Event::Text(t) => out.push_str(&t.unescape().map_err(|e| stream_error(e, ctx))?),
            Event::CData(d) => out.push_str(&String::from_utf8_lossy(&d.into_inner())),
            Event::End(e) if e.name().as_ref() == end => break,
            Event::Eof => return Err(invalid(ctx, "unexpected end of file inside element")),
            _ => {}
        }
    }
    Ok(out)
}

fn parse_u32(text: &str, what: &'static str, ctx: &PageContext) -> Result<u32, IngestError> {
    text.trim().parse().map_err(|_| IngestError::Decode {
        what,
        value: text.to_string(),
        context: ctx.clone(),
    })
}

fn stream_error(err: quick_xml::Error, ctx: &PageContext) -> IngestError {
    match err {
        quick_xml::Error::Io(io) => IngestError::Reader {
            message: io.to_string(),
            context: ctx.clone(),
        },
        other => IngestError::Xml {
            message: other.to_string(),
            context: ctx.clone(),
        },
    }
}

fn invalid(ctx: &PageContext, reason: &'static str) -> IngestError {
    IngestError::InvalidXml {
        reason,
        context: ctx.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SHA1_LEN;
    use std::collections::HashMap;
    use tokio::io::BufReader;

    fn sha(c: char) -> String {
        std::iter::repeat(c).take(SHA1_LEN).collect()
    }

    fn test_env(
        topics: &[(u32, u32)],
        bots: &[u32],
    ) -> (DecoderEnv, mpsc::Receiver<EvolvingPage>) {
        let (pages, receiver) = mpsc::channel(16);
        let env = DecoderEnv {
            topics: Arc::new(TopicTable::from_articles(
                topics.iter().copied().collect::<HashMap<_, _>>(),
            )),
            bots: Arc::new(BotTable::new(
                bots.iter().map(|&id| (id, format!("Bot{id}"))).collect(),
            )),
            pages,
            cancel: CancellationToken::new(),
            revision_buffer_size: 16,
        };
        (env, receiver)
    }

    async fn decode(xml: &str, env: &DecoderEnv) -> Result<(), IngestError> {
        let cursor = std::io::Cursor::new(xml.as_bytes().to_vec());
        decode_stream(cursor, None, env).await
    }

    fn revision_xml(id: u32, timestamp: &str, user: Option<u32>, sha1: &str, text: &str) -> String {
        let contributor = match user {
            Some(user) => format!("<contributor><username>U{user}</username><id>{user}</id></contributor>"),
            None => "<contributor><ip>127.0.0.1</ip></contributor>".to_string(),
        };
        format!(
            "<revision><id>{id}</id><timestamp>{timestamp}</timestamp>{contributor}\
             <text>{text}</text><sha1>{sha1}</sha1></revision>"
        )
    }

    fn page_xml(title: &str, id: u32, revisions: &[String]) -> String {
        format!(
            "<page><title>{title}</title><ns>0</ns><id>{id}</id>{}</page>",
            revisions.join("")
        )
    }

    fn dump_xml(pages: &[String]) -> String {
        format!(
            "<mediawiki xmlns=\"http://www.mediawiki.org/xml/export-0.11/\">{}</mediawiki>",
            pages.join("")
        )
    }

    #[tokio::test]
    async fn minimal_valid_page_round_trips() {
        let (env, mut pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&[page_xml(
            "HG",
            42,
            &[revision_xml(1, "2001-01-15T13:15:00Z", Some(7), &sha('X'), "hello")],
        )]);

        decode(&xml, &env).await.unwrap();

        let mut page = pages.recv().await.expect("one page expected");
        assert_eq!(page.page_id, 42);
        assert_eq!(page.title, "HG");
        assert_eq!(page.topic_id, 9);
        assert!(page.abstract_text.is_empty());

        let revision = page.revisions.recv().await.expect("one revision expected");
        assert_eq!(revision.id, 1);
        assert_eq!(revision.user_id, 7);
        assert!(!revision.is_bot);
        assert_eq!(revision.text, "hello");
        assert_eq!(revision.sha1, sha('X'));
        assert_eq!(revision.is_revert, 0);
        assert_eq!(
            revision.timestamp,
            DateTime::parse_from_rfc3339("2001-01-15T13:15:00Z").unwrap()
        );
        assert!(page.revisions.recv().await.is_none(), "channel must close");
        assert!(pages.recv().await.is_none());
    }

    #[tokio::test]
    async fn revert_distances_follow_document_order() {
        let (env, mut pages) = test_env(&[(1, 1)], &[]);
        let hashes = [sha('a'), sha('b'), sha('c'), sha('a')];
        let revisions: Vec<String> = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| revision_xml(i as u32 + 1, "2004-02-01T00:00:00Z", Some(1), h, "t"))
            .collect();
        let xml = dump_xml(&[page_xml("A", 1, &revisions)]);

        decode(&xml, &env).await.unwrap();

        let mut page = pages.recv().await.unwrap();
        let mut reverts = Vec::new();
        while let Some(revision) = page.revisions.recv().await {
            reverts.push(revision.is_revert);
        }
        assert_eq!(reverts, vec![0, 0, 0, 2]);
    }

    #[tokio::test]
    async fn short_hash_does_not_enter_revert_memory() {
        let (env, mut pages) = test_env(&[(1, 1)], &[]);
        let revisions = vec![
            revision_xml(1, "2004-02-01T00:00:00Z", Some(1), &sha('a'), "t"),
            revision_xml(2, "2004-02-01T00:01:00Z", Some(1), "zzzzz", "t"),
            revision_xml(3, "2004-02-01T00:02:00Z", Some(1), &sha('a'), "t"),
        ];
        let xml = dump_xml(&[page_xml("A", 1, &revisions)]);

        decode(&xml, &env).await.unwrap();

        let mut page = pages.recv().await.unwrap();
        let mut reverts = Vec::new();
        while let Some(revision) = page.revisions.recv().await {
            reverts.push(revision.is_revert);
        }
        assert_eq!(reverts, vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn non_article_page_is_skipped_entirely() {
        let (env, mut pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&[
            page_xml(
                "Talk:Noise",
                100,
                &[revision_xml(5, "2004-02-01T00:00:00Z", Some(1), &sha('x'), "t")],
            ),
            page_xml(
                "HG",
                42,
                &[revision_xml(1, "2001-01-15T13:15:00Z", Some(7), &sha('y'), "t")],
            ),
        ]);

        decode(&xml, &env).await.unwrap();

        let page = pages.recv().await.expect("article after skipped page");
        assert_eq!(page.page_id, 42);
        assert!(pages.recv().await.is_none());
    }

    #[tokio::test]
    async fn page_without_id_fails_with_invalid_xml() {
        let (env, _pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&["<page><title>Broken</title></page>".to_string()]);

        let err = decode(&xml, &env).await.unwrap_err();
        match err {
            IngestError::InvalidXml { context, .. } => {
                assert_eq!(context.last_title, "Broken");
            }
            other => panic!("expected invalid xml, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_title_fails() {
        let (env, _pages) = test_env(&[(42, 9)], &[]);
        let xml =
            dump_xml(&["<page><title>A</title><title>B</title><id>42</id></page>".to_string()]);
        assert!(matches!(
            decode(&xml, &env).await,
            Err(IngestError::InvalidXml { .. })
        ));
    }

    #[tokio::test]
    async fn title_before_page_fails() {
        let (env, _pages) = test_env(&[], &[]);
        let err = decode("<mediawiki><title>X</title></mediawiki>", &env)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidXml { .. }));
    }

    #[tokio::test]
    async fn zero_revision_page_opens_and_closes_channel() {
        let (env, mut pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&[page_xml("Empty", 42, &[])]);

        decode(&xml, &env).await.unwrap();

        let mut page = pages.recv().await.unwrap();
        assert!(page.revisions.recv().await.is_none());
    }

    #[tokio::test]
    async fn anonymous_contributor_maps_to_zero() {
        let (env, mut pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&[page_xml(
            "HG",
            42,
            &[revision_xml(1, "2001-01-15T13:15:00Z", None, &sha('x'), "t")],
        )]);

        decode(&xml, &env).await.unwrap();

        let mut page = pages.recv().await.unwrap();
        let revision = page.revisions.recv().await.unwrap();
        assert_eq!(revision.user_id, ANONYMOUS_USER_ID);
        assert!(!revision.is_bot);
    }

    #[tokio::test]
    async fn bot_contributor_is_flagged() {
        let (env, mut pages) = test_env(&[(42, 9)], &[7]);
        let xml = dump_xml(&[page_xml(
            "HG",
            42,
            &[revision_xml(1, "2001-01-15T13:15:00Z", Some(7), &sha('x'), "t")],
        )]);

        decode(&xml, &env).await.unwrap();

        let mut page = pages.recv().await.unwrap();
        assert!(page.revisions.recv().await.unwrap().is_bot);
    }

    #[tokio::test]
    async fn malformed_timestamp_is_fatal_for_the_file() {
        let (env, mut pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&[page_xml(
            "HG",
            42,
            &[revision_xml(1, "not-a-timestamp", Some(7), &sha('x'), "t")],
        )]);

        let err = decode(&xml, &env).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Decode {
                what: "revision timestamp",
                ..
            }
        ));
        // the announced page's revision channel must still be closed
        let mut page = pages.recv().await.unwrap();
        assert!(page.revisions.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_elements_before_title_are_skipped_as_subtrees() {
        let (env, mut pages) = test_env(&[(42, 9)], &[]);
        let xml = dump_xml(&[format!(
            "<page><junk><id>999</id><title>Ghost</title></junk>\
             <title>HG</title><id>42</id>{}</page>",
            revision_xml(1, "2001-01-15T13:15:00Z", Some(7), &sha('x'), "t")
        )]);

        decode(&xml, &env).await.unwrap();

        let page = pages.recv().await.unwrap();
        assert_eq!(page.title, "HG");
        assert_eq!(page.page_id, 42);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_revision_send() {
        // single-slot revision buffer so the second send must block
        let (pages, mut receiver) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let env = DecoderEnv {
            topics: Arc::new(TopicTable::from_articles(HashMap::from([(1, 1)]))),
            bots: Arc::new(BotTable::default()),
            pages,
            cancel: cancel.clone(),
            revision_buffer_size: 1,
        };

        let revisions: Vec<String> = (0..8)
            .map(|i| revision_xml(i, "2004-02-01T00:00:00Z", Some(1), &sha('a'), "t"))
            .collect();
        let xml = dump_xml(&[page_xml("A", 1, &revisions)]);

        let handle = tokio::spawn(async move {
            let cursor = std::io::Cursor::new(xml.into_bytes());
            decode_stream(cursor, None, &env).await
        });

        // keep the page envelope but never drain its revisions
        let _page = receiver.recv().await.unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("decoder must quiesce after cancellation")
            .unwrap();
        assert!(matches!(result, Err(IngestError::Cancelled { .. })));
    }
}
