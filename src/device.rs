//! TAP/TUN device wrapper exposing whole Ethernet frames over async
//! read/write, decoupling the session engine from OS-specific descriptor
//! handling. Adapted from `utils/device.rs`; the core only ever needs the
//! `AsyncRead + AsyncWrite`-shaped surface this module exposes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tun::AbstractDevice;

#[derive(Clone, Debug)]
pub struct TunConfig {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub mtu: u16,
}

struct Runner {
    config: TunConfig,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl Runner {
    async fn run(&mut self, ready: oneshot::Sender<()>) -> crate::Result<()> {
        let mut config = tun::Configuration::default();
        config
            .address(self.config.address.clone())
            .netmask(self.config.netmask.clone())
            .mtu(self.config.mtu)
            .up();

        #[cfg(target_os = "linux")]
        config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let mut dev = tun::create_as_async(&config)?;
        let _ = ready.send(());

        let mut buf = vec![0u8; self.config.mtu as usize + 64];
        loop {
            tokio::select! {
                n = dev.read(&mut buf) => {
                    match n {
                        Ok(n) => {
                            if self.inbound_tx.send(buf[..n].to_vec()).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "tun device read failed"),
                    }
                }
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = dev.write(&frame).await {
                                tracing::error!(error = %e, "tun device write failed");
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Cloneable handle for writing Ethernet frames out to the device. Many
/// tasks may hold one at once; the underlying `mpsc::Sender` is what
/// makes that safe.
#[derive(Clone)]
pub struct TunSender {
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl TunSender {
    pub async fn send(&self, frame: Vec<u8>) -> crate::Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|e| e.to_string().into())
    }
}

/// Exclusive read side of a running TAP/TUN device task. Only one task
/// may own this at a time, matching the single-consumer `inbound_rx` it
/// wraps.
pub struct TunReceiver {
    inbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl TunReceiver {
    /// Receives the next Ethernet frame read from the device.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound_rx.recv().await
    }
}

/// A running TAP/TUN device: splits into a cloneable [`TunSender`] and
/// an exclusive [`TunReceiver`] so concurrent writers never contend with
/// the single reader.
pub struct TunDevice {
    pub receiver: TunReceiver,
    pub sender: TunSender,
}

impl TunDevice {
    pub async fn create(config: TunConfig) -> crate::Result<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut runner = Runner {
            config,
            inbound_tx,
            outbound_rx,
        };
        tokio::spawn(async move {
            if let Err(e) = runner.run(ready_tx).await {
                tracing::error!(error = %e, "tun device task exited");
            }
        });
        ready_rx.await.map_err(|_| "tun device failed to start")?;

        Ok(Self {
            receiver: TunReceiver { inbound_rx },
            sender: TunSender { outbound_tx },
        })
    }

    /// Splits into independently-ownable halves.
    pub fn split(self) -> (TunSender, TunReceiver) {
        (self.sender, self.receiver)
    }
}
