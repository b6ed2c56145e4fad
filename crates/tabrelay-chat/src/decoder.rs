//! Incremental decoder for the worker's raw reply stream.
//!
//! The remote surface streams lines such as `a0:"text"` (content tokens),
//! `ad:{"finishReason":"stop"}` (finish signal) and occasionally a bare
//! `{"error": ...}` object or an HTML interstitial. Fragments arrive cut at
//! arbitrary byte positions, so the decoder keeps the unconsumed tail in a
//! buffer and only emits a token once its closing quote has been seen.
//!
//! If the job is handed to another worker mid-reply, the decoder drops its
//! buffer and swallows the part of the new reply the client already has.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use tabrelay_core::Error;
use tabrelay_dispatch::Inbound;

/// Delta appended when the upstream stops for content-policy reasons.
pub const CONTENT_FILTER_WARNING: &str =
    "\n\nThe response was cut off, most likely by the model's content moderation or a context length limit.";

pub const CHALLENGE_MESSAGE: &str = "Anti-automation challenge page detected. Refresh the chat page in the browser, complete the verification manually, then retry the request.";

const CONTENT_FILTER: &str = "content-filter";

/// Bytes of unmatched tail kept between fragments so markers split across
/// fragment boundaries are still found.
const OVERLAP: usize = 64;

static CHALLENGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<title>Just a moment\.\.\.</title>|Enable JavaScript and cookies to continue")
        .expect("static regex")
});
static ERROR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\{\s*"error"\s*:"#).expect("static regex"));
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[a-z]0:""#).expect("static regex"));
static FINISH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]d:\{").expect("static regex"));

/// Why a stream ended unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// Anti-automation interstitial in the stream.
    Challenge,
    /// Error reported by the remote surface or the worker.
    Upstream(String),
    /// No data within the inactivity window.
    Timeout(Duration),
    /// Producer went away without an end marker.
    Disconnected,
    /// A redelivered job produced a reply that contradicts what was already sent.
    Diverged,
}

impl DecodeFailure {
    pub fn message(&self) -> String {
        match self {
            DecodeFailure::Challenge => CHALLENGE_MESSAGE.to_string(),
            DecodeFailure::Upstream(message) => message.clone(),
            DecodeFailure::Timeout(window) => {
                format!("Stream timed out after {}s without data", window.as_secs())
            }
            DecodeFailure::Disconnected => {
                "Worker disconnected before the response finished".to_string()
            }
            DecodeFailure::Diverged => {
                "The job was restarted on another worker and its reply no longer matches the text already sent".to_string()
            }
        }
    }

    pub fn into_error(self) -> Error {
        let message = self.message();
        match self {
            DecodeFailure::Challenge => Error::UpstreamChallenge(message),
            DecodeFailure::Upstream(_) | DecodeFailure::Disconnected | DecodeFailure::Diverged => {
                Error::UpstreamError(message)
            }
            DecodeFailure::Timeout(window) => Error::DecodeTimeout(window.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Finished { finish_reason: String },
    Failed(DecodeFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    Delta(String),
    /// Extra content that is not model output (content-policy notice).
    Warning(String),
    /// Ask the owning worker to reload its page.
    RefreshWorker,
    Done(StreamEnd),
}

enum TokenScan {
    /// Span `start..end` whose quoted body is `body`.
    Complete {
        start: usize,
        body: (usize, usize),
        end: usize,
    },
    /// Opening seen at this offset, closing quote not yet received.
    Partial(usize),
    None,
}

/// Per-task decoder state: the unconsumed buffer plus what has been seen.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: String,
    /// Every delta handed out so far.
    emitted: String,
    /// Offset into `emitted` that a restarted reply has caught up to.
    replayed: Option<usize>,
    finish_reason: Option<String>,
    warned: bool,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Finish reason from the last finish signal, if any arrived.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn feed(&mut self, item: Inbound) -> Vec<DecodeEvent> {
        if self.finished {
            return Vec::new();
        }
        match item {
            Inbound::Fragment(text) => self.feed_fragment(&text),
            Inbound::End => vec![self.succeed()],
            Inbound::Error(message) => {
                if CHALLENGE_RE.is_match(&message) {
                    self.challenge()
                } else {
                    vec![self.fail(DecodeFailure::Upstream(message))]
                }
            }
            Inbound::Restart => {
                self.restart();
                Vec::new()
            }
        }
    }

    /// Forget the previous worker's partial output. What it already emitted
    /// stays with the client and is matched against the new reply.
    fn restart(&mut self) {
        info!(already_sent = self.emitted.len(), "Reply restarted on another worker");
        self.buffer.clear();
        self.finish_reason = None;
        self.replayed = (!self.emitted.is_empty()).then_some(0);
    }

    /// Producer channel closed. A finish signal already seen counts as success.
    pub fn close(&mut self) -> Vec<DecodeEvent> {
        if self.finished {
            return Vec::new();
        }
        if self.finish_reason.is_some() {
            vec![self.succeed()]
        } else {
            vec![self.fail(DecodeFailure::Disconnected)]
        }
    }

    /// Inactivity window elapsed.
    pub fn expire(&mut self, window: Duration) -> Vec<DecodeEvent> {
        if self.finished {
            return Vec::new();
        }
        if self.finish_reason.is_some() {
            vec![self.succeed()]
        } else {
            vec![self.fail(DecodeFailure::Timeout(window))]
        }
    }

    // ---------------------------------------------------------------
    // Fragment processing
    // ---------------------------------------------------------------

    fn feed_fragment(&mut self, text: &str) -> Vec<DecodeEvent> {
        self.buffer.push_str(text);

        if CHALLENGE_RE.is_match(&self.buffer) {
            return self.challenge();
        }

        let pending_error = match self.scan_error() {
            Ok(pending) => pending,
            Err(message) => return vec![self.fail(DecodeFailure::Upstream(message))],
        };

        let mut events = Vec::new();
        let mut partial = self.extract_tokens(&mut events);
        let pending_finish = self.scan_finish(&mut events, &mut partial);
        self.compact(partial, pending_error, pending_finish);
        self.settle(events)
    }

    /// Record outgoing deltas, dropping text a restarted reply repeats.
    fn settle(&mut self, events: Vec<DecodeEvent>) -> Vec<DecodeEvent> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            let DecodeEvent::Delta(text) = event else {
                out.push(event);
                continue;
            };
            match self.skip_replayed(text) {
                Ok(Some(fresh)) => {
                    self.emitted.push_str(&fresh);
                    out.push(DecodeEvent::Delta(fresh));
                }
                Ok(None) => {}
                Err(failure) => {
                    out.push(self.fail(failure));
                    break;
                }
            }
        }
        out
    }

    fn skip_replayed(&mut self, text: String) -> Result<Option<String>, DecodeFailure> {
        let Some(pos) = self.replayed else {
            return Ok(Some(text));
        };
        let sent = &self.emitted[pos..];
        if sent.starts_with(text.as_str()) {
            let pos = pos + text.len();
            self.replayed = (pos < self.emitted.len()).then_some(pos);
            Ok(None)
        } else if text.starts_with(sent) {
            let fresh = text[sent.len()..].to_string();
            self.replayed = None;
            Ok((!fresh.is_empty()).then_some(fresh))
        } else {
            warn!(offset = pos, "Restarted reply diverges from the text already sent");
            Err(DecodeFailure::Diverged)
        }
    }

    /// Look for an embedded `{"error": ...}` object.
    ///
    /// Returns the message of a complete one as `Err`, otherwise the offset of
    /// an object that is still arriving.
    fn scan_error(&self) -> Result<Option<usize>, String> {
        let mut pending = None;
        for found in ERROR_RE.find_iter(&self.buffer) {
            let mut values =
                serde_json::Deserializer::from_str(&self.buffer[found.start()..]).into_iter::<Value>();
            match values.next() {
                Some(Ok(value)) => return Err(error_message(&value["error"])),
                Some(Err(e)) if e.is_eof() => {
                    pending.get_or_insert(found.start());
                }
                _ => {}
            }
        }
        Ok(pending)
    }

    /// Emit every complete token and drop its span from the buffer.
    ///
    /// Returns the offset of a trailing partial token.
    fn extract_tokens(&mut self, events: &mut Vec<DecodeEvent>) -> Option<usize> {
        let mut rest = String::with_capacity(self.buffer.len());
        let mut cursor = 0;
        let mut partial = None;

        loop {
            match scan_token(&self.buffer, cursor) {
                TokenScan::Complete { start, body, end } => {
                    rest.push_str(&self.buffer[cursor..start]);
                    let raw = &self.buffer[body.0..body.1];
                    match unescape(raw) {
                        Ok(text) if !text.is_empty() => events.push(DecodeEvent::Delta(text)),
                        Ok(_) => {}
                        Err(e) => warn!(token = raw, "Skipping undecodable token: {}", e),
                    }
                    cursor = end;
                }
                TokenScan::Partial(start) => {
                    partial = Some(rest.len() + (start - cursor));
                    break;
                }
                TokenScan::None => break,
            }
        }

        rest.push_str(&self.buffer[cursor..]);
        self.buffer = rest;
        partial
    }

    /// Record finish signals and drop their spans, shifting `partial` to match.
    ///
    /// Returns the offset of a finish object that is still arriving.
    fn scan_finish(
        &mut self,
        events: &mut Vec<DecodeEvent>,
        partial: &mut Option<usize>,
    ) -> Option<usize> {
        let mut from = 0;
        loop {
            let found = FINISH_RE.find_at(&self.buffer, from)?;
            let (start, brace) = (found.start(), found.end() - 1);
            let mut values =
                serde_json::Deserializer::from_str(&self.buffer[brace..]).into_iter::<Value>();

            match values.next() {
                Some(Ok(value)) => {
                    let end = brace + values.byte_offset();
                    match value.get("finishReason").and_then(Value::as_str) {
                        Some(reason) => {
                            info!(finish_reason = reason, "Finish signal received");
                            if reason == CONTENT_FILTER && !self.warned {
                                self.warned = true;
                                events.push(DecodeEvent::Warning(CONTENT_FILTER_WARNING.to_string()));
                            }
                            self.finish_reason = Some(reason.to_string());
                            self.buffer.replace_range(start..end, "");
                            if let Some(offset) = partial.as_mut().filter(|p| **p >= end) {
                                *offset -= end - start;
                            }
                            from = start;
                        }
                        None => from = found.end(),
                    }
                }
                Some(Err(e)) if e.is_eof() => return Some(start),
                _ => from = found.end(),
            }
        }
    }

    /// Drop everything that can no longer contribute to a match.
    fn compact(&mut self, partial: Option<usize>, pending_error: Option<usize>, pending_finish: Option<usize>) {
        let mut keep = self.buffer.len().saturating_sub(OVERLAP);
        while !self.buffer.is_char_boundary(keep) {
            keep -= 1;
        }
        // Pending error offsets predate token removal; only the finish and
        // partial offsets refer to the current buffer.
        if pending_error.is_some() {
            keep = 0;
        }
        for offset in [partial, pending_finish].into_iter().flatten() {
            keep = keep.min(offset);
        }
        self.buffer.drain(..keep);
    }

    // ---------------------------------------------------------------
    // Termination
    // ---------------------------------------------------------------

    fn challenge(&mut self) -> Vec<DecodeEvent> {
        vec![
            DecodeEvent::RefreshWorker,
            self.fail(DecodeFailure::Challenge),
        ]
    }

    fn succeed(&mut self) -> DecodeEvent {
        self.terminate();
        DecodeEvent::Done(StreamEnd::Finished {
            finish_reason: self.finish_reason.clone().unwrap_or_else(|| "stop".into()),
        })
    }

    fn fail(&mut self, failure: DecodeFailure) -> DecodeEvent {
        self.terminate();
        DecodeEvent::Done(StreamEnd::Failed(failure))
    }

    fn terminate(&mut self) {
        self.finished = true;
        self.buffer = String::new();
    }
}

/// Find the next `x0:"..."` token at or after `from`.
fn scan_token(buffer: &str, from: usize) -> TokenScan {
    let Some(found) = TOKEN_RE.find_at(buffer, from) else {
        return TokenScan::None;
    };
    let bytes = buffer.as_bytes();
    let body_start = found.end();
    let mut i = body_start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => {
                return TokenScan::Complete {
                    start: found.start(),
                    body: (body_start, i),
                    end: i + 1,
                }
            }
            _ => i += 1,
        }
    }
    TokenScan::Partial(found.start())
}

/// Decode a token body with JSON string-literal escape rules.
fn unescape(raw: &str) -> serde_json::Result<String> {
    serde_json::from_str(&format!("\"{}\"", raw))
}

fn error_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => value.to_string(),
        },
        Value::Null => "Unknown upstream error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(s: &str) -> Inbound {
        Inbound::Fragment(s.to_string())
    }

    fn deltas(events: &[DecodeEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Delta(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn feed_all(decoder: &mut StreamDecoder, items: Vec<Inbound>) -> Vec<DecodeEvent> {
        items.into_iter().flat_map(|item| decoder.feed(item)).collect()
    }

    #[test]
    fn test_split_token_reassembled() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(
            &mut decoder,
            vec![
                frag("a0:\"Hello\""),
                frag("a0:\", wor"),
                frag("ld!\""),
                frag("ad:{\"finishReason\":\"stop\"}"),
                Inbound::End,
            ],
        );
        assert_eq!(
            events,
            vec![
                DecodeEvent::Delta("Hello".into()),
                DecodeEvent::Delta(", world!".into()),
                DecodeEvent::Done(StreamEnd::Finished {
                    finish_reason: "stop".into()
                }),
            ]
        );
    }

    #[test]
    fn test_partial_token_not_emitted() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(frag("a0:\"Hel")).is_empty());
        assert!(decoder.feed(frag("lo")).is_empty());
        assert_eq!(deltas(&decoder.feed(frag("\"\n"))), vec!["Hello"]);
    }

    #[test]
    fn test_many_tokens_in_order() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(frag("a0:\"one\"\na0:\" two\"\nb0:\" three\"\n"));
        assert_eq!(deltas(&events), vec!["one", " two", " three"]);
    }

    #[test]
    fn test_escapes() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(frag(r#"a0:"say \"hi\"\n\\ \u00e9""#));
        assert_eq!(deltas(&events), vec!["say \"hi\"\n\\ é"]);
    }

    #[test]
    fn test_escaped_quote_split_across_fragments() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(frag(r#"a0:"a\"#)).is_empty());
        assert_eq!(deltas(&decoder.feed(frag(r#""b""#))), vec!["a\"b"]);
    }

    #[test]
    fn test_empty_token_skipped() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(frag("a0:\"\"")).is_empty());
    }

    #[test]
    fn test_embedded_error() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(frag("{\"error\":\"rate limited\"} a0:\"late\""));
        assert_eq!(
            events,
            vec![DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Upstream(
                "rate limited".into()
            )))]
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_error_split_across_fragments() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(frag("{\"error\": \"rate ")).is_empty());
        let events = decoder.feed(frag("limited\"}"));
        assert_eq!(
            events,
            vec![DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Upstream(
                "rate limited".into()
            )))]
        );
    }

    #[test]
    fn test_challenge_stops_emission() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(frag(
            "<html><title>Just a moment...</title></html>a0:\"ignored\"",
        ));
        assert_eq!(
            events,
            vec![
                DecodeEvent::RefreshWorker,
                DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Challenge)),
            ]
        );
        assert!(decoder.feed(frag("a0:\"more\"")).is_empty());
        assert!(decoder.feed(Inbound::End).is_empty());
    }

    #[test]
    fn test_challenge_marker_split() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(frag("a0:\"x\" Enable JavaScript and ")).len(), 1);
        let events = decoder.feed(frag("cookies to continue"));
        assert_eq!(events[0], DecodeEvent::RefreshWorker);
    }

    #[test]
    fn test_challenge_in_error_report() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(Inbound::Error(
            "<!DOCTYPE html><title>Just a moment...</title>".into(),
        ));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Challenge))
        );
    }

    #[test]
    fn test_content_filter_warns_once() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(
            &mut decoder,
            vec![
                frag("a0:\"partial\"\nad:{\"finishReason\":\"content-filter\"}"),
                frag("bd:{\"finishReason\":\"content-filter\"}"),
                Inbound::End,
            ],
        );
        assert_eq!(
            events,
            vec![
                DecodeEvent::Delta("partial".into()),
                DecodeEvent::Warning(CONTENT_FILTER_WARNING.into()),
                DecodeEvent::Done(StreamEnd::Finished {
                    finish_reason: "content-filter".into()
                }),
            ]
        );
    }

    #[test]
    fn test_stop_reason_has_no_warning() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(frag("ad:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":3}}"));
        assert!(events.is_empty());
        assert_eq!(decoder.finish_reason(), Some("stop"));
        assert!(!decoder.is_finished());
    }

    #[test]
    fn test_finish_before_partial_token() {
        let mut decoder = StreamDecoder::new();
        let padding = "x".repeat(100);
        let first = format!("{}ad:{{\"finishReason\":\"stop\"}}\na0:\"tail", padding);
        assert!(decoder.feed(frag(&first)).is_empty());
        assert_eq!(deltas(&decoder.feed(frag(" end\""))), vec!["tail end"]);
    }

    #[test]
    fn test_finish_signal_split() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(frag("ad:{\"finishRea")).is_empty());
        assert!(decoder.finish_reason().is_none());
        decoder.feed(frag("son\":\"content-filter\"}"));
        assert_eq!(decoder.finish_reason(), Some("content-filter"));
    }

    #[test]
    fn test_expire_after_finish_succeeds() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(frag("ad:{\"finishReason\":\"stop\"}"));
        assert_eq!(
            decoder.expire(Duration::from_secs(5)),
            vec![DecodeEvent::Done(StreamEnd::Finished {
                finish_reason: "stop".into()
            })]
        );
    }

    #[test]
    fn test_expire_without_finish_times_out() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(frag("a0:\"x\""));
        let events = decoder.expire(Duration::from_secs(60));
        assert_eq!(
            events,
            vec![DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Timeout(
                Duration::from_secs(60)
            )))]
        );
        assert!(decoder.expire(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_restart_drops_dead_worker_partial() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(
            &mut decoder,
            vec![
                frag("a0:\"Hel"),
                Inbound::Restart,
                frag("a0:\"Hello\""),
                Inbound::End,
            ],
        );
        assert_eq!(
            events,
            vec![
                DecodeEvent::Delta("Hello".into()),
                DecodeEvent::Done(StreamEnd::Finished {
                    finish_reason: "stop".into()
                }),
            ]
        );
    }

    #[test]
    fn test_restart_skips_text_already_sent() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(
            &mut decoder,
            vec![
                frag("a0:\"Hello\"a0:\", wo"),
                Inbound::Restart,
                frag("a0:\"He\"a0:\"llo\""),
                frag("a0:\", world\""),
                frag("a0:\"!\""),
                Inbound::End,
            ],
        );
        assert_eq!(deltas(&events), vec!["Hello", ", world", "!"]);
    }

    #[test]
    fn test_restart_with_different_reply_fails() {
        let mut decoder = StreamDecoder::new();
        let events = feed_all(
            &mut decoder,
            vec![
                frag("a0:\"Hello\""),
                Inbound::Restart,
                frag("a0:\"Goodbye\"a0:\"more\""),
            ],
        );
        assert_eq!(
            events,
            vec![
                DecodeEvent::Delta("Hello".into()),
                DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Diverged)),
            ]
        );
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_restart_clears_finish_signal() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(frag("a0:\"x\"ad:{\"finishReason\":\"length\"}"));
        assert_eq!(decoder.finish_reason(), Some("length"));
        decoder.feed(Inbound::Restart);
        assert_eq!(decoder.finish_reason(), None);
    }

    #[test]
    fn test_close_is_disconnect() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(
            decoder.close(),
            vec![DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Disconnected))]
        );
    }

    #[test]
    fn test_buffer_stays_bounded() {
        let mut decoder = StreamDecoder::new();
        for _ in 0..1000 {
            decoder.feed(frag("a2:[{\"type\":\"metadata\"}]\n"));
        }
        assert!(decoder.buffer.len() <= OVERLAP);
    }

    #[test]
    fn test_multibyte_content() {
        let mut decoder = StreamDecoder::new();
        let mut events = decoder.feed(frag("a0:\"héllo wörld ✓"));
        events.extend(decoder.feed(frag(" 日本語\"")));
        assert_eq!(deltas(&events), vec!["héllo wörld ✓ 日本語"]);
    }

    #[test]
    fn test_upstream_error_report() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(Inbound::Error("tab closed".into()));
        let DecodeEvent::Done(StreamEnd::Failed(failure)) = &events[0] else {
            panic!("expected failure");
        };
        assert_eq!(failure.message(), "tab closed");
        assert_eq!(failure.clone().into_error().status_code(), 502);
    }
}
