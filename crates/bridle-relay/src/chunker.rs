//! Outbound response framing: inline when small, chunked when the
//! serialized frame would exceed the negotiated `maxPayloadBytes`.

use bridle_core::{PayloadId, RequestId};
use bridle_ops::chunk::split;
use bridle_ops::frames::OpsFrame;
use metrics::counter;
use serde_json::Value;
use tracing::debug;

use crate::connection::OpsClientConn;
use crate::metrics::OPS_CHUNKED_RESPONSES_TOTAL;

/// Frames carrying one response payload: either a single inline
/// `ops_response`, or a chunked announcement followed by its `ops_chunk`
/// slices.
#[must_use]
pub fn response_frames(
    request_id: RequestId,
    payload: &Value,
    max_payload_bytes: usize,
    chunk_bytes: usize,
) -> Vec<OpsFrame> {
    let inline = OpsFrame::response(request_id.clone(), payload.clone());
    let serialized_len = serde_json::to_string(&inline).map_or(usize::MAX, |s| s.len());
    if serialized_len <= max_payload_bytes {
        return vec![inline];
    }

    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let chunks = split(&bytes, chunk_bytes);
    let total = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
    let payload_id = PayloadId::new();
    debug!(
        %payload_id,
        total_chunks = total,
        payload_bytes = bytes.len(),
        "response exceeds negotiated payload size, chunking"
    );

    let mut frames = Vec::with_capacity(chunks.len() + 1);
    frames.push(OpsFrame::chunked_response(
        request_id,
        payload_id.clone(),
        total,
    ));
    for (index, data) in chunks.into_iter().enumerate() {
        frames.push(OpsFrame::Chunk {
            payload_id: payload_id.clone(),
            chunk_index: u32::try_from(index).unwrap_or(u32::MAX),
            total_chunks: total,
            data,
        });
    }
    frames
}

/// Enqueue a response to a client, chunking as needed.
pub fn send_response(
    conn: &OpsClientConn,
    request_id: RequestId,
    payload: &Value,
    chunk_bytes: usize,
) {
    let frames = response_frames(request_id, payload, conn.max_payload_bytes, chunk_bytes);
    if frames.len() > 1 {
        counter!(OPS_CHUNKED_RESPONSES_TOTAL).increment(1);
    }
    for frame in frames {
        if !conn.send(frame) {
            // The write half is gone; remaining chunks would be orphans.
            break;
        }
    }
}
