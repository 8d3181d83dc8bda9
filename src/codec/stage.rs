//! Transcode stages between chunk channels
//!
//! Each stage owns its codec on a dedicated thread and maps exactly one chunk
//! in to one chunk out, in arrival order. A stage ends when its input closes
//! or nobody reads its output.

use std::thread;

use tokio::sync::{mpsc, oneshot};

use crate::audio::chunk::AudioChunk;
use crate::codec::{OpusDecoder, OpusEncoder};
use crate::config::OpusConfig;
use crate::error::CodecError;

/// PCM chunks in, Opus chunks out
pub async fn spawn_encode_stage(
    config: OpusConfig,
    mut input: mpsc::Receiver<AudioChunk>,
    capacity: usize,
) -> Result<mpsc::Receiver<AudioChunk>, CodecError> {
    let (tx, rx) = mpsc::channel(capacity);
    let (init_tx, init_rx) = oneshot::channel::<Result<(), CodecError>>();

    thread::Builder::new()
        .name("opus-encode".to_string())
        .spawn(move || {
            let mut encoder = match OpusEncoder::new(config) {
                Ok(encoder) => {
                    let _ = init_tx.send(Ok(()));
                    encoder
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };

            while let Some(chunk) = input.blocking_recv() {
                match encoder.encode_chunk(&chunk) {
                    Ok(encoded) => {
                        if tx.blocking_send(encoded).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(index = chunk.index, "Encoding failed, ending stream: {}", e);
                        break;
                    }
                }
            }
            let stats = encoder.stats();
            tracing::debug!(
                frames = stats.frames_encoded,
                bytes = stats.bytes_produced,
                avg_frame = stats.average_frame_size,
                "encode stage finished"
            );
        })
        .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

    init_rx
        .await
        .map_err(|_| CodecError::EncoderInit("encoder thread died".into()))??;
    Ok(rx)
}

/// Opus chunks in, f32 PCM chunks out
pub async fn spawn_decode_stage(
    sample_rate: u32,
    channels: u16,
    mut input: mpsc::Receiver<AudioChunk>,
    capacity: usize,
) -> Result<mpsc::Receiver<AudioChunk>, CodecError> {
    let (tx, rx) = mpsc::channel(capacity);
    let (init_tx, init_rx) = oneshot::channel::<Result<(), CodecError>>();

    thread::Builder::new()
        .name("opus-decode".to_string())
        .spawn(move || {
            let mut decoder = match OpusDecoder::new(sample_rate, channels) {
                Ok(decoder) => {
                    let _ = init_tx.send(Ok(()));
                    decoder
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };

            'stream: while let Some(chunk) = input.blocking_recv() {
                match decoder.decode_chunk(&chunk) {
                    Ok(decoded) => {
                        for pcm in decoded {
                            if tx.blocking_send(pcm).is_err() {
                                break 'stream;
                            }
                        }
                    }
                    // a corrupt frame is skipped, the next one may decode fine
                    Err(e) => tracing::warn!(index = chunk.index, "Dropping undecodable frame: {}", e),
                }
            }
            let stats = decoder.stats();
            tracing::debug!(
                frames = stats.frames_decoded,
                concealed = stats.frames_concealed,
                "decode stage finished"
            );
        })
        .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

    init_rx
        .await
        .map_err(|_| CodecError::DecoderInit("decoder thread died".into()))??;
    Ok(rx)
}
