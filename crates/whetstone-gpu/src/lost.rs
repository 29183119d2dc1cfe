//! One-shot device-loss notification channel.
//!
//! Backends own the sending half and resolve it at most once, from whatever
//! context observes the loss (a driver callback, a destroy call). The holder
//! owns the receiving half and either polls it between uses or awaits it when
//! a test announced an intentional loss. The observed value is cached so the
//! notification can be re-read across uses of the same holder.

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Why a device became unusable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LossReason {
    Unknown,
    /// The handle was explicitly destroyed.
    Destroyed,
}

impl LossReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LossReason::Unknown => "unknown",
            LossReason::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loss notification delivered at most once per device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceLoss {
    pub reason: LossReason,
    pub message: String,
}

impl DeviceLoss {
    pub fn new(reason: LossReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

/// Sending half, owned by the backend that observes the loss.
#[derive(Debug)]
pub struct DeviceLostSender {
    tx: oneshot::Sender<DeviceLoss>,
}

impl DeviceLostSender {
    /// Delivers the loss. The value is dropped if the receiving holder is
    /// already gone.
    pub fn send(self, loss: DeviceLoss) {
        let _ = self.tx.send(loss);
    }
}

/// Receiving half, owned by the holder.
#[derive(Debug)]
pub struct DeviceLostReceiver {
    rx: Option<oneshot::Receiver<DeviceLoss>>,
    observed: Option<DeviceLoss>,
}

pub fn device_lost_channel() -> (DeviceLostSender, DeviceLostReceiver) {
    let (tx, rx) = oneshot::channel();
    (DeviceLostSender { tx }, DeviceLostReceiver { rx: Some(rx), observed: None })
}

impl DeviceLostReceiver {
    /// Non-blocking check for a delivered loss. Caches the notification once
    /// seen.
    pub fn observed(&mut self) -> Option<&DeviceLoss> {
        if self.observed.is_none() {
            let resolution = match self.rx.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(loss) => Some(Some(loss)),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Closed) => Some(None),
                },
                None => None,
            };
            if let Some(outcome) = resolution {
                self.rx = None;
                self.observed = outcome;
            }
        }
        self.observed.as_ref()
    }

    /// Waits for the notification. Resolves `None` if the sending side went
    /// away without ever reporting a loss.
    pub async fn wait(&mut self) -> Option<&DeviceLoss> {
        if self.observed.is_none() {
            if let Some(rx) = self.rx.take() {
                if let Ok(loss) = rx.await {
                    self.observed = Some(loss);
                }
            }
        }
        self.observed.as_ref()
    }
}
