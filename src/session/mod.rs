//! Connection session
//!
//! Owns the provider controller for one plugin process and drives it through
//! the [`state`] machine. At most one connect attempt is in flight; it runs on
//! its own task so the D-Bus call that triggered it returns immediately.

pub mod notify;
pub mod state;

use crate::error::{FailureReason, PluginError, PluginResult};
use crate::provider::{ConnectionController, ControllerContext, StartRequest};
use notify::NotificationSink;
use state::{ServiceState, SessionEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Single-flight token, released exactly once when dropped
struct ConnectGuard(Arc<AtomicBool>);

impl ConnectGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> PluginResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PluginError::AlreadyConnecting)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The in-flight connect task and the signal that cancels its start
struct ConnectTask {
    handle: JoinHandle<()>,
    cancel: Arc<Notify>,
}

pub struct Session {
    controller: Mutex<Box<dyn ConnectionController>>,
    state: Mutex<ServiceState>,
    sink: Arc<dyn NotificationSink>,
    context: ControllerContext,
    connecting: Arc<AtomicBool>,
    connect_task: StdMutex<Option<ConnectTask>>,
    span: Span,
}

impl Session {
    pub fn new(
        controller: Box<dyn ConnectionController>,
        context: ControllerContext,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            controller: Mutex::new(controller),
            state: Mutex::new(ServiceState::Init),
            sink,
            context,
            connecting: Arc::new(AtomicBool::new(false)),
            connect_task: StdMutex::new(None),
            span: Span::current(),
        }
    }

    pub async fn state(&self) -> ServiceState {
        *self.state.lock().await
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Run one transition and emit its notifications while holding the state
    /// lock, so concurrent transitions never interleave their signals.
    async fn apply(&self, event: SessionEvent) -> PluginResult<bool> {
        let mut state = self.state.lock().await;
        let transition = state.apply(&event)?;
        if transition.is_noop() {
            return Ok(false);
        }
        if *state != transition.state {
            info!("State {} -> {}", *state, transition.state);
        }
        *state = transition.state;

        for notification in transition.notifications {
            debug!("Emitting {}: {:?}", notification.signal_name(), notification);
            if let Err(e) = self.sink.notify(notification).await {
                error!("Could not emit signal: {}", e);
            }
        }
        Ok(true)
    }

    /// Accept a connect request and start the controller in the background.
    ///
    /// Fails with `AlreadyConnecting` while a previous attempt is running.
    pub async fn connect(self: &Arc<Self>, request: StartRequest) -> PluginResult<()> {
        let guard = ConnectGuard::acquire(&self.connecting)?;
        self.apply(SessionEvent::Connect).await?;
        info!("Connecting {} ({})", request.name, request.uuid);

        let session = Arc::clone(self);
        let cancel = Arc::new(Notify::new());
        let cancelled = Arc::clone(&cancel);
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                session.run_connect(request, cancelled).await;
            }
            .instrument(self.span.clone()),
        );
        if let Ok(mut slot) = self.connect_task.lock() {
            *slot = Some(ConnectTask { handle, cancel });
        }
        Ok(())
    }

    /// Start the controller. Cancellation is only observed while `start` is
    /// pending; once an outcome exists its transition always runs to the end.
    async fn run_connect(&self, request: StartRequest, cancel: Arc<Notify>) {
        let outcome = {
            let mut controller = self.controller.lock().await;
            let started = tokio::select! {
                outcome = controller.start(&request, &self.context) => outcome,
                _ = cancel.notified() => {
                    info!("Connect of {} cancelled while starting", request.name);
                    return;
                }
            };
            if started.is_ok() {
                if let Some(readiness) = controller.readiness() {
                    if !readiness.check().await {
                        warn!("{} started but {} does not hold yet", controller.name(), readiness.label());
                    }
                }
            }
            started
        };

        match outcome {
            Ok(result) => {
                info!("Connection controller started: {:?}", result);
                if let Err(e) = self.apply(SessionEvent::Connected(Box::new(result))).await {
                    warn!("Discarding connection result: {}", e);
                }
            }
            Err(e) => {
                if e.is_expected() {
                    error!("Connect failed: {}. Stopping service", e);
                } else {
                    error!("Connect failed: {:?}. Stopping service", e);
                }
                self.fail(e.failure_reason()).await;
            }
        }
    }

    async fn fail(&self, reason: FailureReason) {
        match self.apply(SessionEvent::Failed(reason)).await {
            Ok(_) => self.stop_controller().await,
            Err(e) => warn!("Ignoring failure after state change: {}", e),
        }
    }

    async fn stop_controller(&self) {
        if let Err(e) = self.controller.lock().await.stop().await {
            error!("Stopping controller failed: {}", e);
        }
        if let Err(e) = self.apply(SessionEvent::StopCompleted).await {
            warn!("{}", e);
        }
    }

    fn take_connect_task(&self) -> Option<ConnectTask> {
        self.connect_task.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Stop the connection. Idempotent; a no-op once stopped.
    ///
    /// A connect still in `start` is cancelled and its controller stopped.
    /// A connect that already has an outcome finishes its transition first.
    pub async fn disconnect(&self) -> PluginResult<()> {
        async {
            if let Some(task) = self.take_connect_task() {
                // A permit is stored if the task is not waiting yet
                task.cancel.notify_one();
                if let Err(e) = task.handle.await {
                    if e.is_panic() {
                        error!("Connect task panicked: {}", e);
                    } else {
                        warn!("Connect task ended abnormally: {}", e);
                    }
                }
            }

            if !self.apply(SessionEvent::Disconnect).await? {
                debug!("Already stopped");
                return Ok(());
            }
            self.stop_controller().await;
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }
}
