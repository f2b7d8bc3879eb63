//! Random nut source with a pre-generated buffer.

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time;
use tracing::warn;

use super::{Nut, NutSource};
use crate::codec::sqrl64_encode;
use crate::error::{Result, SspError};

/// How many nuts the generator task keeps ready, smoothing load spikes on
/// the entropy source.
const BUFFER_DEPTH: usize = 1000;

/// How long `next` waits on the buffer before failing the request.
const NEXT_TIMEOUT: Duration = Duration::from_millis(20);

/// Produces nuts from `byte_size` bytes of OS randomness.
///
/// A background task keeps a channel of pre-generated values filled, so the
/// request path normally never touches the entropy source directly.
/// Construct inside a tokio runtime.
pub struct RandomNutSource {
    receiver: Mutex<mpsc::Receiver<Nut>>,
}

impl RandomNutSource {
    /// `byte_size` must be between 8 and 20. Shorter nuts are preferred;
    /// pick a larger size only if your deployment needs more bits to stay
    /// collision-free within the nut TTL.
    pub fn new(byte_size: usize) -> Result<Self> {
        if !(8..=20).contains(&byte_size) {
            return Err(SspError::NutGeneration {
                message: format!("nut byte size {byte_size} outside 8..=20"),
            });
        }
        let (sender, receiver) = mpsc::channel(BUFFER_DEPTH);
        tokio::spawn(fill_buffer(byte_size, sender));
        Ok(Self {
            receiver: Mutex::new(receiver),
        })
    }
}

async fn fill_buffer(byte_size: usize, sender: mpsc::Sender<Nut>) {
    loop {
        let mut bytes = vec![0u8; byte_size];
        if let Err(error) = OsRng.try_fill_bytes(&mut bytes) {
            warn!(%error, "entropy read failed, backing off");
            time::sleep(Duration::from_millis(10)).await;
            continue;
        }
        if sender.send(Nut::new(sqrl64_encode(&bytes))).await.is_err() {
            // Source dropped.
            return;
        }
    }
}

#[async_trait]
impl NutSource for RandomNutSource {
    async fn next(&self) -> Result<Nut> {
        let mut receiver = self.receiver.lock().await;
        match time::timeout(NEXT_TIMEOUT, receiver.recv()).await {
            Ok(Some(nut)) => Ok(nut),
            Ok(None) => Err(SspError::NutGeneration {
                message: "nut generator task stopped".to_owned(),
            }),
            Err(_) => Err(SspError::NutGeneration {
                message: "timed out waiting for a buffered nut".to_owned(),
            }),
        }
    }
}
