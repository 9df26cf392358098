use bytes::BytesMut;
use compression_codecs::{EncodeV2, gzip::GzipEncoder};
use compression_core::Level;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// Size of the scratch buffer each pooled encoder compresses into.
const OUTPUT_BUFFER_SIZE: usize = 8 * 1024;

/// Upper bound on idle encoders retained between requests.
const MAX_IDLE: usize = 32;

struct Slot {
    encoder: Box<dyn EncodeV2 + Send>,
    scratch: Vec<u8>,
}

impl Slot {
    fn new(level: Level) -> Self {
        Self {
            encoder: new_encoder(level),
            scratch: vec![0u8; OUTPUT_BUFFER_SIZE],
        }
    }
}

fn new_encoder(level: Level) -> Box<dyn EncodeV2 + Send> {
    Box::new(GzipEncoder::new(level.into()))
}

/// A bounded pool of gzip encoders bound to a fixed compression level.
///
/// `acquire` never fails: it pops an idle encoder or builds a fresh one, so
/// pool exhaustion is not a failure mode. Each handle owns its encoder
/// exclusively for the lifetime of one response and returns it on drop,
/// reset to discard state, regardless of how far encoding progressed.
#[derive(Clone)]
pub(crate) struct EncoderPool {
    level: Level,
    idle: Arc<Mutex<Vec<Slot>>>,
}

impl EncoderPool {
    pub(crate) fn new(level: Level) -> Self {
        Self {
            level,
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn acquire(&self) -> PooledEncoder {
        let slot = lock(&self.idle)
            .pop()
            .unwrap_or_else(|| Slot::new(self.level));
        PooledEncoder {
            slot: Some(slot),
            pool: self.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        lock(&self.idle).len()
    }
}

fn lock(idle: &Mutex<Vec<Slot>>) -> MutexGuard<'_, Vec<Slot>> {
    match idle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// An exclusively-owned gzip encoder checked out of an [`EncoderPool`].
pub(crate) struct PooledEncoder {
    slot: Option<Slot>,
    pool: EncoderPool,
}

impl PooledEncoder {
    /// Compresses `input` fully, appending whatever the encoder emits to
    /// `out`. The encoder may buffer and emit nothing for small inputs.
    pub(crate) fn encode(&mut self, input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let Some(slot) = self.slot.as_mut() else {
            return Err(released());
        };
        let mut input_buf = PartialBuffer::new(input);
        loop {
            let mut output = WriteBuffer::new_initialized(slot.scratch.as_mut_slice());
            slot.encoder
                .encode(&mut input_buf, &mut output)
                .map_err(io::Error::other)?;
            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&slot.scratch[..written]);
            }
            if input_buf.written_len() >= input.len() {
                break;
            }
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Flushes the encoder's buffered state and writes the gzip footer.
    pub(crate) fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        let Some(slot) = self.slot.as_mut() else {
            return Err(released());
        };
        loop {
            let mut output = WriteBuffer::new_initialized(slot.scratch.as_mut_slice());
            let done = slot.encoder.finish(&mut output).map_err(io::Error::other)?;
            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&slot.scratch[..written]);
            }
            if done {
                break;
            }
        }
        Ok(())
    }
}

fn released() -> io::Error {
    io::Error::other("gzip encoder used after release")
}

impl Drop for PooledEncoder {
    fn drop(&mut self) {
        let Some(mut slot) = self.slot.take() else {
            return;
        };
        // Reset to discard state: drop the used stream and rebind a fresh one
        // at the pool's level before the slot goes back on the idle list.
        slot.encoder = new_encoder(self.pool.level);
        let mut idle = lock(&self.pool.idle);
        if idle.len() < MAX_IDLE {
            idle.push(slot);
        }
    }
}
