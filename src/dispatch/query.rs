//! Worker-side execution of queued outbound work.
//!
//! Two job shapes run here: HTTP-style queries from the cloud (the hard
//! path: deadline and cancellation checks, size cap, optional gzip, framed
//! reply on the callback topic) and plain binary publishes, including the
//! serialized batch job.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, error, warn};

use crate::queue::{BinPayload, Query, QueryPayload};
use crate::tx::{
    self, EC_REQ_REPLY_TOO_BIG, EC_SND_TIMEOUT, EC_ZLIB_ERROR, EMSG_REQ_REPLY_TOO_BIG,
    EMSG_SND_TIMEOUT, EMSG_ZLIB_ERROR,
};
use crate::{LinkShared, WebApi, WebApiResponse};

/// Cap on the local web-API response body.
pub const MAX_WEB_RESPONSE_SIZE: usize = 30 * 1024 * 1024;

const ACCEPT_ENCODING_HEADER: &str = "accept-encoding:";

/// Executes one dequeued query inside a worker.
pub async fn execute_query(shared: Arc<LinkShared>, web_api: Arc<dyn WebApi>, query: Query) {
    shared.stats.query_dispatched();
    match query.payload {
        QueryPayload::Http(_) => execute_http_query(shared, web_api, query).await,
        QueryPayload::Bin(ref payload) => {
            if let Err(e) = tx::publish_bin(&shared, payload).await {
                warn!("Failed to send {}: {e}", payload.msg_name);
            }
        }
    }
}

/// One batch job: the accumulated batchable messages, published serially so
/// FIFO holds within the batch.
pub async fn execute_batch(shared: Arc<LinkShared>, items: Vec<BinPayload>) {
    debug!("Executing batch of {} messages", items.len());
    for payload in items {
        if shared.shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = tx::publish_bin(&shared, &payload).await {
            warn!("Failed to send batched {}: {e}", payload.msg_name);
        }
    }
}

async fn execute_http_query(shared: Arc<LinkShared>, web_api: Arc<dyn WebApi>, query: Query) {
    let (Some(msg_id), Some(callback_topic)) = (query.msg_id.clone(), query.callback_topic.clone())
    else {
        error!("HTTP query without msg-id or callback-topic, dropping");
        return;
    };
    let QueryPayload::Http(http) = &query.payload else {
        return;
    };

    let cancel = shared.inflight.add(&msg_id);

    // queue wait already blew the deadline: answer with the timeout error
    // without executing anything
    let timeout = query.timeout.unwrap_or(std::time::Duration::from_secs(60));
    if query.created.elapsed() > timeout || cancel.is_cancelled() {
        warn!(
            "QUERY CANCELED: QUEUE TIME EXCEEDED {:?} (LIMIT {:?})",
            query.created.elapsed(),
            timeout
        );
        send_error(&shared, &callback_topic, &msg_id, 504, EC_SND_TIMEOUT, EMSG_SND_TIMEOUT).await;
        shared.inflight.remove(&msg_id);
        return;
    }

    // run the collaborator query off the async runtime; it may block
    let path = http.path.clone();
    let api = web_api.clone();
    let started = Instant::now();
    let mut response = match tokio::task::spawn_blocking(move || api.execute(&path)).await {
        Ok(response) => response,
        Err(e) => {
            error!("Web query worker panicked: {e}");
            shared.inflight.remove(&msg_id);
            return;
        }
    };
    let t_exec_us = started.elapsed().as_micros() as i64;
    shared.stats.query_executed(t_exec_us as u64);

    // cancellation check after execution, before any reply is built
    if cancel.is_cancelled() {
        send_error(&shared, &callback_topic, &msg_id, 504, EC_SND_TIMEOUT, EMSG_SND_TIMEOUT).await;
        shared.inflight.remove(&msg_id);
        return;
    }

    if response.body.len() > MAX_WEB_RESPONSE_SIZE {
        response = WebApiResponse {
            code: 413,
            content_type: "text/plain".into(),
            body: b"response is too big".to_vec(),
        };
    }

    let wants_gzip = accepts_gzip(&http.raw);
    let (body, gzipped) = if wants_gzip && !response.body.is_empty() {
        match gzip(&response.body) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                error!("Error compressing body: {e}");
                send_error(&shared, &callback_topic, &msg_id, 500, EC_ZLIB_ERROR, EMSG_ZLIB_ERROR)
                    .await;
                shared.inflight.remove(&msg_id);
                return;
            }
        }
    } else {
        (response.body, false)
    };

    let reply = build_http_reply(response.code, &response.content_type, gzipped, &body);
    let outcome = tx::send_http_response(
        &shared,
        &callback_topic,
        &msg_id,
        t_exec_us,
        query.created_unix_us,
        response.code,
        reply,
    )
    .await;

    if let Err(tx::PublishError::TooBig(size)) = outcome {
        // the transport refuses oversize replies; report that back instead
        warn!("HTTP reply of {size} bytes is too big for the transport");
        send_error(
            &shared,
            &callback_topic,
            &msg_id,
            403,
            EC_REQ_REPLY_TOO_BIG,
            EMSG_REQ_REPLY_TOO_BIG,
        )
        .await;
    } else if let Err(e) = outcome {
        warn!("Failed to publish HTTP reply for {msg_id}: {e}");
    }

    shared.inflight.remove(&msg_id);
}

async fn send_error(
    shared: &LinkShared,
    callback_topic: &str,
    msg_id: &str,
    http_code: u16,
    error_code: u32,
    error_message: &str,
) {
    if let Err(e) =
        tx::send_http_error(shared, callback_topic, msg_id, http_code, error_code, error_message)
            .await
    {
        warn!("Failed to send error reply for {msg_id}: {e}");
    }
}

/// Checks the request's `Accept-Encoding` header for gzip support.
fn accepts_gzip(raw_request: &str) -> bool {
    raw_request.lines().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with(ACCEPT_ENCODING_HEADER) && lower.contains("gzip")
    })
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// HTTP response header block, concatenated with the body, matching what a
/// local web server would have sent.
fn build_http_reply(code: u16, content_type: &str, gzipped: bool, body: &[u8]) -> Vec<u8> {
    let reason = match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        504 => "Gateway Timeout",
        _ => "",
    };
    let mut head = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n",
        body.len()
    );
    if gzipped {
        head.push_str("Content-Encoding: gzip\r\n");
    }
    head.push_str("\r\n");
    let mut reply = head.into_bytes();
    reply.extend_from_slice(body);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_detection_is_case_insensitive_and_header_scoped() {
        let raw = "GET /api HTTP/1.1\r\nAccept-Encoding: deflate, GZIP\r\n\r\n";
        assert!(accepts_gzip(raw));
        let raw = "GET /api HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n";
        assert!(!accepts_gzip(raw));
        // "gzip" in the request line alone is not a header
        let raw = "GET /gzip HTTP/1.1\r\n\r\n";
        assert!(!accepts_gzip(raw));
    }

    #[test]
    fn gzip_round_trips() {
        use std::io::Read as _;
        let body = b"a body worth compressing, a body worth compressing";
        let compressed = gzip(body).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn reply_header_block_carries_encoding_marker() {
        let reply = build_http_reply(200, "application/json", true, b"{}");
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Encoding: gzip\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }
}
