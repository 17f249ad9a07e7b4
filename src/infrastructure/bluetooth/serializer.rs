//! Command Serializer
//!
//! One worker thread per link owns the byte channel and runs queued
//! commands strictly one at a time, in admission order. Results go back to
//! each caller through a oneshot.
//!
//! When the link is closed, commands that have not started fail with
//! [`LinkError::LinkClosed`]. When a frame faults the stream, the worker
//! closes the queue itself and reports a [`LinkFault`] so the connection
//! manager can reconnect.

use crate::domain::error::LinkError;
use crate::domain::models::ActuatorAngles;
use crate::infrastructure::bluetooth::channel::ByteChannel;
use crate::infrastructure::bluetooth::connection::LinkHandle;
use crate::infrastructure::bluetooth::protocol;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// A transport fault observed on link `link_id`.
#[derive(Debug, Clone)]
pub struct LinkFault {
    pub link_id: u64,
    pub error: LinkError,
}

enum Request {
    Upload {
        angles: ActuatorAngles,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Download {
        reply: oneshot::Sender<Result<ActuatorAngles, LinkError>>,
    },
}

struct PendingCommand {
    link_id: u64,
    request: Request,
}

impl PendingCommand {
    fn fail(self, error: LinkError) {
        match self.request {
            Request::Upload { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Request::Download { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<PendingCommand>,
    closed: bool,
}

struct Shared {
    link_id: u64,
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed and fail everything still queued. Returns how many were failed.
    fn close(&self) -> usize {
        let drained: Vec<PendingCommand> = {
            let mut queue = self.lock();
            queue.closed = true;
            queue.pending.drain(..).collect()
        };
        self.ready.notify_all();

        let count = drained.len();
        for command in drained {
            command.fail(LinkError::LinkClosed);
        }
        count
    }

    /// Block until a command is available; `None` once closed.
    fn next(&self) -> Option<PendingCommand> {
        let mut queue = self.lock();
        loop {
            if queue.closed {
                return None;
            }
            if let Some(command) = queue.pending.pop_front() {
                return Some(command);
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Handle for submitting commands to a link's worker. Cheap to clone.
#[derive(Clone)]
pub struct CommandSerializer {
    shared: Arc<Shared>,
}

impl CommandSerializer {
    /// Take ownership of `link` and start its worker.
    ///
    /// The worker runs until [`close`](Self::close) is called or a stream
    /// fault occurs, then closes the channel.
    pub fn spawn(
        link: LinkHandle,
        settle: Duration,
        faults: mpsc::UnboundedSender<LinkFault>,
    ) -> Result<Self, LinkError> {
        let shared = Arc::new(Shared {
            link_id: link.id,
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        });

        let worker_shared = shared.clone();
        std::thread::Builder::new()
            .name(format!("link-worker-{}", link.id))
            .spawn(move || run_worker(worker_shared, link, settle, faults))?;

        Ok(Self { shared })
    }

    pub fn link_id(&self) -> u64 {
        self.shared.link_id
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Queue an upload. Queue position is fixed when this returns.
    pub fn submit_upload(
        &self,
        angles: ActuatorAngles,
    ) -> impl Future<Output = Result<(), LinkError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        self.admit(Request::Upload { angles, reply });
        async move { rx.await.unwrap_or(Err(LinkError::LinkClosed)) }
    }

    /// Queue a download. Queue position is fixed when this returns.
    pub fn submit_download(
        &self,
    ) -> impl Future<Output = Result<ActuatorAngles, LinkError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        self.admit(Request::Download { reply });
        async move { rx.await.unwrap_or(Err(LinkError::LinkClosed)) }
    }

    /// Stop accepting commands and fail the queued ones with `LinkClosed`.
    ///
    /// A command already on the wire finishes; the worker then closes the
    /// channel. Returns the number of commands that were cancelled.
    pub fn close(&self) -> usize {
        let cancelled = self.shared.close();
        if cancelled > 0 {
            debug!(
                "Link {}: cancelled {} queued command(s)",
                self.shared.link_id, cancelled
            );
        }
        cancelled
    }

    fn admit(&self, request: Request) {
        let command = PendingCommand {
            link_id: self.shared.link_id,
            request,
        };

        let mut queue = self.shared.lock();
        if queue.closed {
            drop(queue);
            command.fail(LinkError::LinkClosed);
            return;
        }
        queue.pending.push_back(command);
        trace!(
            "Link {}: {} command(s) queued",
            self.shared.link_id,
            queue.pending.len()
        );
        drop(queue);
        self.shared.ready.notify_one();
    }
}

fn run_worker(
    shared: Arc<Shared>,
    mut link: LinkHandle,
    settle: Duration,
    faults: mpsc::UnboundedSender<LinkFault>,
) {
    debug!("Link {}: worker started", link.id);

    while let Some(command) = shared.next() {
        // The link may have been torn down since the command was dequeued.
        if command.link_id != link.id || shared.is_closed() {
            command.fail(LinkError::LinkClosed);
            continue;
        }

        if let Some(error) = execute(command, link.channel.as_mut(), settle) {
            warn!("Link {}: stream fault: {}", link.id, error);
            shared.close();
            let _ = faults.send(LinkFault {
                link_id: link.id,
                error,
            });
            break;
        }
    }

    if let Err(e) = link.channel.close() {
        warn!("Link {}: error closing channel: {}", link.id, e);
    }
    debug!("Link {}: worker stopped", link.id);
}

/// Run one command. Returns the error when it faulted the stream.
fn execute(
    command: PendingCommand,
    channel: &mut dyn ByteChannel,
    settle: Duration,
) -> Option<LinkError> {
    match command.request {
        Request::Upload { angles, reply } => {
            let result = protocol::upload(channel, &angles, settle);
            let fault = stream_fault(&result);
            let _ = reply.send(result);
            fault
        }
        Request::Download { reply } => {
            let result = protocol::download(channel);
            let fault = stream_fault(&result);
            let _ = reply.send(result);
            fault
        }
    }
}

fn stream_fault<T>(result: &Result<T, LinkError>) -> Option<LinkError> {
    match result {
        Err(e) if e.is_stream_fault() => Some(e.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::{EchoChannel, ScriptedChannel};

    const SETTLE: Duration = Duration::from_millis(5);

    fn link(id: u64, channel: impl ByteChannel + 'static) -> LinkHandle {
        LinkHandle {
            id,
            address: "20:15:03:18:19:71".to_string(),
            channel: Box::new(channel),
        }
    }

    fn angles(a: u8) -> ActuatorAngles {
        ActuatorAngles::new([a, a, a, a]).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_never_interleave() {
        let channel = ScriptedChannel::default().with_write_delay(Duration::from_millis(2));
        let probe = channel.clone();
        let (faults, _fault_rx) = mpsc::unbounded_channel();
        let serializer = CommandSerializer::spawn(link(1, channel), SETTLE, faults).unwrap();

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let serializer = serializer.clone();
            tasks.push(tokio::spawn(async move {
                serializer.submit_upload(angles(i * 10)).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(()));
        }

        assert_eq!(probe.overlapping_writes(), 0);
        let frames = probe.frames();
        assert_eq!(frames.len(), 16);
        assert!(frames.iter().all(|f| f.len() == 5 && f[0] == 0xF7));
        serializer.close();
    }

    #[tokio::test]
    async fn test_frames_follow_submission_order() {
        let channel = ScriptedChannel::default();
        let probe = channel.clone();
        let (faults, _fault_rx) = mpsc::unbounded_channel();
        let serializer = CommandSerializer::spawn(link(2, channel), SETTLE, faults).unwrap();

        let pending: Vec<_> = [30, 60, 90, 120]
            .into_iter()
            .map(|a| serializer.submit_upload(angles(a)))
            .collect();
        for fut in pending {
            assert_eq!(fut.await, Ok(()));
        }

        let expected: Vec<Vec<u8>> = [30u8, 60, 90, 120]
            .iter()
            .map(|&a| protocol::upload_frame(&angles(a)).to_vec())
            .collect();
        assert_eq!(probe.frames(), expected);
        serializer.close();
    }

    #[tokio::test]
    async fn test_download_sees_preceding_uploads() {
        let (faults, _fault_rx) = mpsc::unbounded_channel();
        let serializer =
            CommandSerializer::spawn(link(3, EchoChannel::default()), SETTLE, faults).unwrap();

        let first = serializer.submit_upload(angles(40));
        let second = serializer.submit_upload(ActuatorAngles::new([1, 2, 3, 4]).unwrap());
        let download = serializer.submit_download();

        assert_eq!(first.await, Ok(()));
        assert_eq!(second.await, Ok(()));
        assert_eq!(
            download.await,
            Ok(ActuatorAngles::new([1, 2, 3, 4]).unwrap())
        );
        serializer.close();
    }

    #[tokio::test]
    async fn test_io_failure_closes_queue_and_reports_fault() {
        let channel = ScriptedChannel::default().fail_writes_after(2);
        let probe = channel.clone();
        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        let serializer = CommandSerializer::spawn(link(4, channel), SETTLE, faults).unwrap();

        let results: Vec<_> = (0..5)
            .map(|i| serializer.submit_upload(angles(i * 20)))
            .collect();
        let mut outcomes = Vec::new();
        for fut in results {
            outcomes.push(fut.await);
        }

        assert_eq!(outcomes[0], Ok(()));
        assert_eq!(outcomes[1], Ok(()));
        assert!(matches!(outcomes[2], Err(LinkError::IoFailure(_))));
        assert_eq!(outcomes[3], Err(LinkError::LinkClosed));
        assert_eq!(outcomes[4], Err(LinkError::LinkClosed));

        let fault = fault_rx.recv().await.unwrap();
        assert_eq!(fault.link_id, 4);
        assert!(matches!(fault.error, LinkError::IoFailure(_)));

        assert!(serializer.is_closed());
        assert_eq!(
            serializer.submit_download().await,
            Err(LinkError::LinkClosed)
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn test_protocol_mismatch_is_a_fault() {
        let channel = ScriptedChannel::new(&[0x00, 1, 2, 3, 4]);
        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        let serializer = CommandSerializer::spawn(link(5, channel), SETTLE, faults).unwrap();

        let download = serializer.submit_download();
        let queued = serializer.submit_upload(angles(10));

        assert!(matches!(
            download.await,
            Err(LinkError::ProtocolMismatch { actual: 0x00, .. })
        ));
        assert_eq!(queued.await, Err(LinkError::LinkClosed));
        assert!(matches!(
            fault_rx.recv().await.unwrap().error,
            LinkError::ProtocolMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_cancels_queued_but_not_in_flight() {
        let channel = ScriptedChannel::default().with_write_delay(Duration::from_millis(50));
        let probe = channel.clone();
        let (faults, mut fault_rx) = mpsc::unbounded_channel();
        let serializer = CommandSerializer::spawn(link(6, channel), SETTLE, faults).unwrap();

        let in_flight = serializer.submit_upload(angles(10));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued_a = serializer.submit_upload(angles(20));
        let queued_b = serializer.submit_download();

        assert_eq!(serializer.close(), 2);
        assert_eq!(queued_a.await, Err(LinkError::LinkClosed));
        assert_eq!(queued_b.await, Err(LinkError::LinkClosed));
        assert_eq!(in_flight.await, Ok(()));

        assert_eq!(
            serializer.submit_upload(angles(30)).await,
            Err(LinkError::LinkClosed)
        );
        assert_eq!(probe.frames().len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(probe.is_closed());
        // Teardown is not a fault.
        assert!(fault_rx.try_recv().is_err());
    }
}
