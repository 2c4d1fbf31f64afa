//! The run loop: start modules in order, block until shutdown, stop them in
//! reverse.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A long-lived part of a process, e.g. a server, a registrar or a client
/// pool.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> Result<(), BoxError>;

    /// Runs once every module has been initialized.
    async fn after_init(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BoxError>;
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("module {module} failed to start: {source}")]
    Start {
        module: String,
        #[source]
        source: BoxError,
    },
    #[error("cannot install signal handler: {0}")]
    Signal(#[from] io::Error),
}

/// What ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    Signal(&'static str),
}

#[derive(Default)]
pub struct Runner {
    modules: Vec<Arc<dyn Module>>,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new() -> Self {
        Runner::default()
    }

    /// Appends a module. Modules start in the order they were added.
    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    /// A handle that ends [`Runner::run`] when cancelled.
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<Exit, RunError> {
        let mut signals = Signals::install()?;

        for (i, module) in self.modules.iter().enumerate() {
            if let Err(source) = module.init().await {
                stop_all(&self.modules[..i]).await;
                return Err(RunError::Start {
                    module: module.name().to_owned(),
                    source,
                });
            }
            info!(module = module.name(), "initialized");
        }
        for module in &self.modules {
            if let Err(source) = module.after_init().await {
                stop_all(&self.modules).await;
                return Err(RunError::Start {
                    module: module.name().to_owned(),
                    source,
                });
            }
        }

        let exit = tokio::select! {
            _ = self.shutdown.cancelled() => Exit::Shutdown,
            name = signals.recv() => Exit::Signal(name),
        };
        info!(?exit, "shutting down");
        stop_all(&self.modules).await;
        Ok(exit)
    }
}

/// Stops `modules` last to first. Failures are logged and the rest still stop.
async fn stop_all(modules: &[Arc<dyn Module>]) {
    for module in modules.iter().rev() {
        match module.stop().await {
            Ok(()) => info!(module = module.name(), "stopped"),
            Err(err) => error!(module = module.name(), error = %err, "stop failed"),
        }
    }
}

#[cfg(unix)]
struct Signals(Vec<(&'static str, tokio::signal::unix::Signal)>);

#[cfg(unix)]
impl Signals {
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Signals(vec![
            ("SIGINT", signal(SignalKind::interrupt())?),
            ("SIGQUIT", signal(SignalKind::quit())?),
            ("SIGTERM", signal(SignalKind::terminate())?),
            ("SIGABRT", signal(SignalKind::from_raw(libc::SIGABRT))?),
        ]))
    }

    async fn recv(&mut self) -> &'static str {
        let waits = self.0.iter_mut().map(|(name, sig)| {
            let name = *name;
            Box::pin(async move {
                sig.recv().await;
                name
            })
        });
        futures::future::select_all(waits).await.0
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> io::Result<Self> {
        Ok(Signals)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Step {
        name: &'static str,
        journal: Journal,
        fail_init: bool,
        fail_stop: bool,
    }

    impl Step {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Step {
                name,
                journal: journal.clone(),
                fail_init: false,
                fail_stop: false,
            }
        }
    }

    #[async_trait]
    impl Module for Step {
        fn name(&self) -> &str {
            self.name
        }

        async fn init(&self) -> Result<(), BoxError> {
            self.journal.push(format!("init {}", self.name));
            if self.fail_init {
                return Err("no port".into());
            }
            Ok(())
        }

        async fn after_init(&self) -> Result<(), BoxError> {
            self.journal.push(format!("after {}", self.name));
            Ok(())
        }

        async fn stop(&self) -> Result<(), BoxError> {
            self.journal.push(format!("stop {}", self.name));
            if self.fail_stop {
                return Err("busy".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn ordered_start_and_reverse_stop() {
        let journal = Journal::default();
        let mut registrar = Step::new("registrar", &journal);
        registrar.fail_stop = true;
        let runner = Runner::new()
            .with_module(Arc::new(Step::new("server", &journal)))
            .with_module(Arc::new(registrar));
        let shutdown = runner.shutdown();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            shutdown.cancel();
        });

        assert_eq!(Exit::Shutdown, runner.run().await.unwrap());
        assert_eq!(
            vec![
                "init server",
                "init registrar",
                "after server",
                "after registrar",
                "stop registrar",
                "stop server",
            ],
            journal.entries()
        );
    }

    #[tokio::test]
    async fn failed_init_stops_started_modules() {
        let journal = Journal::default();
        let mut broken = Step::new("broken", &journal);
        broken.fail_init = true;
        let runner = Runner::new()
            .with_module(Arc::new(Step::new("server", &journal)))
            .with_module(Arc::new(broken))
            .with_module(Arc::new(Step::new("never", &journal)));

        match runner.run().await {
            Err(RunError::Start { module, .. }) => assert_eq!("broken", module),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            vec!["init server", "init broken", "stop server"],
            journal.entries()
        );
    }
}
