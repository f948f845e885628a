//! Scripted transport fakes shared by the service tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{sync::mpsc, time::sleep};

use crate::{
    error::ConnectionError,
    services::transport::{Connector, Established, Transport},
};

/// One scripted inbound item; `None` closes the link.
pub(crate) type Frame = Option<Result<String, ConnectionError>>;

pub(crate) struct ScriptedTransport {
    frames: mpsc::UnboundedReceiver<Frame>,
    sent: mpsc::UnboundedSender<String>,
}

impl Transport for ScriptedTransport {
    fn send(&mut self, text: String) -> BoxFuture<'_, Result<(), ConnectionError>> {
        let _ = self.sent.send(text);
        Box::pin(async { Ok(()) })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, ConnectionError>>> {
        Box::pin(async move {
            match self.frames.recv().await {
                Some(frame) => frame,
                None => futures::future::pending().await,
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Connector replaying `plan`, then `fallback` forever. Every successful link gets an
/// inbound channel driven through [`ScriptedConnector::push`]; outbound frames of all
/// links land in the receiver returned by [`ScriptedConnector::new`].
pub(crate) struct ScriptedConnector {
    plan: Mutex<VecDeque<Result<(), ConnectionError>>>,
    fallback: Result<(), ConnectionError>,
    delay: Duration,
    calls: AtomicUsize,
    links: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
    sent: mpsc::UnboundedSender<String>,
}

impl ScriptedConnector {
    pub(crate) fn new(
        plan: Vec<Result<(), ConnectionError>>,
        fallback: Result<(), ConnectionError>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (sent, sent_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: Mutex::new(plan.into()),
            fallback,
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            sent,
        });
        (connector, sent_rx)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn push(&self, link: usize, frame: Frame) {
        self.links.lock().unwrap()[link].send(frame).unwrap();
    }

    pub(crate) fn push_text(&self, link: usize, text: &str) {
        self.push(link, Some(Ok(text.to_string())));
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        _url: &str,
        token: &str,
    ) -> BoxFuture<'static, Result<Established, ConnectionError>> {
        assert!(!token.is_empty());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let established = outcome.map(|()| {
            let (frames_tx, frames) = mpsc::unbounded_channel();
            self.links.lock().unwrap().push(frames_tx);
            Established {
                transport: Box::new(ScriptedTransport {
                    frames,
                    sent: self.sent.clone(),
                }),
                socket_id: format!("sock-{call}"),
            }
        });
        let delay = self.delay;
        Box::pin(async move {
            sleep(delay).await;
            established
        })
    }
}
