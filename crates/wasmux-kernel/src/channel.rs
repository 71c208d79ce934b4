//! Request/response channel between a guest process and the kernel.
//!
//! The guest side blocks on one call at a time; `call` takes `&mut self`, so
//! a second request cannot be issued before the first is answered. Each
//! process gets its own channel and its own serving task, so a process whose
//! requests are slow to answer never delays another.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use wasmux_types::{Errno, KernelResult};

/// A request waiting for the kernel's answer.
#[derive(Debug)]
pub struct PendingCall<Req, Resp> {
    pub request: Req,
    reply: oneshot::Sender<Resp>,
}

impl<Req, Resp> PendingCall<Req, Resp> {
    /// Answer the call. Returns false if the caller has gone away.
    pub fn reply(self, response: Resp) -> bool {
        self.reply.send(response).is_ok()
    }

    /// Split into the request and a reply handle.
    pub fn into_parts(self) -> (Req, oneshot::Sender<Resp>) {
        (self.request, self.reply)
    }
}

/// The process side of a channel.
#[derive(Debug)]
pub struct GuestEndpoint<Req, Resp> {
    tx: mpsc::Sender<PendingCall<Req, Resp>>,
}

impl<Req, Resp> GuestEndpoint<Req, Resp> {
    /// Send a request and wait for its response.
    ///
    /// `Canceled` if the kernel side was dropped, or dropped the call
    /// without answering.
    pub async fn call(&mut self, request: Req) -> KernelResult<Resp> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingCall { request, reply })
            .await
            .map_err(|_| Errno::Canceled)?;
        rx.await.map_err(|_| Errno::Canceled)
    }

    /// Whether the kernel side still exists.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The kernel side of a channel.
#[derive(Debug)]
pub struct KernelEndpoint<Req, Resp> {
    rx: mpsc::Receiver<PendingCall<Req, Resp>>,
}

impl<Req, Resp> KernelEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Next pending call, or `None` once the guest side is dropped.
    pub async fn recv(&mut self) -> Option<PendingCall<Req, Resp>> {
        self.rx.recv().await
    }

    /// Answer calls with `handler` on a task of their own until the guest
    /// side is dropped.
    pub fn serve<F, Fut>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Req) -> Fut + Send + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(call) = self.recv().await {
                let (request, reply) = call.into_parts();
                let response = handler(request).await;
                if reply.send(response).is_err() {
                    debug!("caller went away before the reply");
                }
            }
            debug!("guest endpoint closed");
        })
    }
}

/// Create a connected pair of endpoints.
pub fn channel<Req, Resp>() -> (GuestEndpoint<Req, Resp>, KernelEndpoint<Req, Resp>) {
    let (tx, rx) = mpsc::channel(1);
    (GuestEndpoint { tx }, KernelEndpoint { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_call_and_reply() {
        let (mut guest, mut kernel) = channel::<u32, String>();
        let server = tokio::spawn(async move {
            let call = kernel.recv().await.unwrap();
            let answer = format!("got {}", call.request);
            assert!(call.reply(answer));
        });
        assert_eq!(guest.call(7).await.unwrap(), "got 7");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_kernel_gone_cancels() {
        let (mut guest, kernel) = channel::<u32, u32>();
        drop(kernel);
        assert!(!guest.is_connected());
        assert_eq!(guest.call(1).await, Err(Errno::Canceled));
    }

    #[tokio::test]
    async fn test_unanswered_call_cancels() {
        let (mut guest, mut kernel) = channel::<u32, u32>();
        tokio::spawn(async move {
            let call = kernel.recv().await.unwrap();
            drop(call);
        });
        assert_eq!(guest.call(1).await, Err(Errno::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_process_does_not_block_another() {
        let (mut slow, slow_kernel) = channel::<u64, u64>();
        let (mut fast, fast_kernel) = channel::<u64, u64>();
        slow_kernel.serve(|ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms
        });
        let server = fast_kernel.serve(|n| async move { n * 2 });

        let slow_call = tokio::spawn(async move { slow.call(10_000).await });
        let answer = tokio::time::timeout(Duration::from_millis(5), fast.call(21))
            .await
            .expect("fast process was held up");
        assert_eq!(answer, Ok(42));
        assert_eq!(slow_call.await.unwrap(), Ok(10_000));

        drop(fast);
        server.await.unwrap();
    }
}
