//! Read side of the packet pump
//!
//! One task per session reads packets from the interface and feeds them to
//! the stack. It is cancelled by closing the interface, which makes the
//! pending read fail with `Closed`, and joined with a bounded wait so a
//! stalled device shows up as a warning instead of a hung teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tunsocks_tun::PacketInterface;

use crate::event::SessionStatsRef;
use crate::stack::PacketStack;

/// How the reader loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The device reported end of stream
    EndOfStream,
    /// The interface was closed
    Cancelled,
    /// A read failed while the interface was open
    Fault(String),
}

/// Reads packets from an interface into a stack
pub struct InterfaceReader {
    interface: Arc<dyn PacketInterface>,
    stack: Arc<dyn PacketStack>,
    stats: SessionStatsRef,
    buffer_size: usize,
}

impl InterfaceReader {
    pub fn new(
        interface: Arc<dyn PacketInterface>,
        stack: Arc<dyn PacketStack>,
        stats: SessionStatsRef,
        buffer_size: usize,
    ) -> Self {
        Self {
            interface,
            stack,
            stats,
            buffer_size,
        }
    }

    /// Spawn the read loop on the current runtime
    pub fn spawn(self) -> ReaderHandle {
        let (exit_tx, exit_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let exit = self.run().await;
            // The receiver is gone when nobody supervises this reader
            let _ = exit_tx.send(exit.clone());
            exit
        });

        ReaderHandle {
            task,
            exit_rx: Some(exit_rx),
        }
    }

    async fn run(self) -> ReaderExit {
        let name = self.interface.name().to_string();
        log::info!("Interface reader started on {}", name);

        let mut buf = vec![0u8; self.buffer_size];
        let exit = loop {
            match self.interface.read(&mut buf).await {
                Ok(0) => {
                    log::debug!("Input EOS on {}", name);
                    break ReaderExit::EndOfStream;
                }
                Ok(n) => {
                    log::trace!("Input size={}", n);
                    self.stats.record_rx(n);
                    self.stack.input_packet(&buf[..n]).await;
                }
                Err(e) if e.is_closed() || self.interface.is_closed() => {
                    break ReaderExit::Cancelled;
                }
                Err(e) => {
                    log::warn!("Failed to read {}: {}", name, e);
                    break ReaderExit::Fault(e.to_string());
                }
            }
        };

        log::info!("Interface reader on {} exited: {:?}", name, exit);
        exit
    }
}

/// Handle to a spawned reader
pub struct ReaderHandle {
    task: JoinHandle<ReaderExit>,
    exit_rx: Option<oneshot::Receiver<ReaderExit>>,
}

impl ReaderHandle {
    /// Take the one-shot notification sent when the loop ends
    pub fn take_exit_notification(&mut self) -> Option<oneshot::Receiver<ReaderExit>> {
        self.exit_rx.take()
    }

    /// Wait for the task to end, at most `timeout`
    ///
    /// Close the interface first. Returns `None` if the task panicked or
    /// did not exit in time; in the latter case it is aborted.
    pub async fn join(mut self, timeout: Duration) -> Option<ReaderExit> {
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                log::error!("Interface reader task failed: {}", e);
                None
            }
            Err(_) => {
                log::warn!(
                    "Interface reader did not exit within {:?} after close, aborting it",
                    timeout
                );
                self.task.abort();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::event::SessionStats;
    use crate::sink::PacketSink;
    use crate::stack::StackConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tunsocks_tun::MemoryInterface;

    #[derive(Default)]
    struct CollectingStack {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl PacketStack for CollectingStack {
        fn set_log_level(&self, _level: log::LevelFilter) {}

        async fn start(&self, _sink: Arc<dyn PacketSink>, _config: StackConfig) -> Result<()> {
            Ok(())
        }

        async fn input_packet(&self, packet: &[u8]) {
            self.packets.lock().unwrap().push(packet.to_vec());
        }

        async fn stop(&self) {}
    }

    fn reader(
        interface: Arc<dyn PacketInterface>,
        stack: Arc<CollectingStack>,
        buffer_size: usize,
    ) -> InterfaceReader {
        InterfaceReader::new(interface, stack, Arc::new(SessionStats::new()), buffer_size)
    }

    #[tokio::test]
    async fn test_forwards_packets_until_end_of_stream() {
        let (interface, mut peer) = MemoryInterface::pair("mem0", 1500);
        let stack = Arc::new(CollectingStack::default());

        peer.inject(vec![1, 2, 3]);
        peer.inject(vec![4; 1500]);
        peer.end_of_stream();

        let handle = reader(Arc::new(interface), stack.clone(), 2048).spawn();
        let exit = handle.join(Duration::from_secs(1)).await;

        assert_eq!(exit, Some(ReaderExit::EndOfStream));
        let packets = stack.packets.lock().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], vec![1, 2, 3]);
        assert_eq!(packets[1].len(), 1500);
    }

    #[tokio::test]
    async fn test_oversized_packet_truncated_to_buffer() {
        let (interface, mut peer) = MemoryInterface::pair("mem0", 1500);
        let stack = Arc::new(CollectingStack::default());

        peer.inject(vec![9; 3000]);
        peer.end_of_stream();

        let handle = reader(Arc::new(interface), stack.clone(), 2048).spawn();
        handle.join(Duration::from_secs(1)).await;

        assert_eq!(stack.packets.lock().unwrap()[0].len(), 2048);
    }

    #[tokio::test]
    async fn test_close_cancels_reader() {
        let (interface, _peer) = MemoryInterface::pair("mem0", 1500);
        let interface: Arc<dyn PacketInterface> = Arc::new(interface);
        let stack = Arc::new(CollectingStack::default());

        let mut handle = reader(interface.clone(), stack, 2048).spawn();
        let exited = handle.take_exit_notification().unwrap();

        tokio::task::yield_now().await;
        interface.close().unwrap();

        assert_eq!(
            handle.join(Duration::from_secs(1)).await,
            Some(ReaderExit::Cancelled)
        );
        assert_eq!(exited.await.unwrap(), ReaderExit::Cancelled);
    }
}
