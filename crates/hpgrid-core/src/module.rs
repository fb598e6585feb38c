//! Module lifecycle shared by Master, Optimizer and Scheduler.
//!
//! Every process runs the same coarse phase machine:
//!
//! ```text
//! pre_process
//!   loop:
//!     inner_loop_pre_process
//!     inner_loop_main_process
//!     inner_loop_post_process
//!     check_error
//!     sleep(loop_interval) | shutdown
//! post_process
//! ```
//!
//! Any loop step returning `Ok(false)` ends the loop normally and
//! `post_process` runs. An error skips `post_process` and calls
//! `on_abort` instead, so a module can clear its liveness flag.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::types::Role;

#[async_trait]
pub trait Module: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn role(&self) -> Role;

    fn loop_interval(&self) -> Duration;

    async fn pre_process(&mut self) -> Result<(), Self::Error>;

    async fn inner_loop_pre_process(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn inner_loop_main_process(&mut self) -> Result<bool, Self::Error>;

    async fn inner_loop_post_process(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn check_error(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn post_process(&mut self) -> Result<(), Self::Error>;

    async fn on_abort(&mut self) {}
}

/// Drive a module through its whole lifecycle.
///
/// Setting the shutdown channel to `true` ends the loop after the current
/// iteration and still runs `post_process`.
pub async fn run_module<M: Module>(
    module: &mut M,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), M::Error> {
    let role = module.role();
    info!(%role, "module starting");

    if let Err(e) = module.pre_process().await {
        error!(%role, error = %e, "pre_process failed");
        module.on_abort().await;
        return Err(e);
    }

    if let Err(e) = drive_loop(module, &mut shutdown).await {
        error!(%role, error = %e, "module loop failed");
        module.on_abort().await;
        return Err(e);
    }

    module.post_process().await?;
    info!(%role, "module finished");
    Ok(())
}

async fn drive_loop<M: Module>(
    module: &mut M,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), M::Error> {
    let role = module.role();
    let mut shutdown_open = true;

    loop {
        if !module.inner_loop_pre_process().await? {
            break;
        }
        if !module.inner_loop_main_process().await? {
            break;
        }
        if !module.inner_loop_post_process().await? {
            break;
        }
        if !module.check_error().await? {
            break;
        }

        let interval = module.loop_interval();
        if shutdown_open {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow() => {
                        info!(%role, "shutdown requested");
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => {
                        debug!(%role, "shutdown sender dropped");
                        shutdown_open = false;
                    }
                },
            }
        } else {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[derive(Default)]
    struct Counter {
        ticks: u32,
        stop_after: u32,
        fail_at: Option<u32>,
        pre: bool,
        post: bool,
        aborted: bool,
    }

    #[async_trait]
    impl Module for Counter {
        type Error = Boom;

        fn role(&self) -> Role {
            Role::Optimizer
        }

        fn loop_interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        async fn pre_process(&mut self) -> Result<(), Boom> {
            self.pre = true;
            Ok(())
        }

        async fn inner_loop_main_process(&mut self) -> Result<bool, Boom> {
            self.ticks += 1;
            if Some(self.ticks) == self.fail_at {
                return Err(Boom);
            }
            Ok(self.ticks < self.stop_after)
        }

        async fn post_process(&mut self) -> Result<(), Boom> {
            self.post = true;
            Ok(())
        }

        async fn on_abort(&mut self) {
            self.aborted = true;
        }
    }

    #[tokio::test]
    async fn loop_runs_until_main_returns_false() {
        let (_tx, rx) = watch::channel(false);
        let mut module = Counter {
            stop_after: 3,
            ..Default::default()
        };
        run_module(&mut module, rx).await.unwrap();
        assert!(module.pre);
        assert!(module.post);
        assert_eq!(module.ticks, 3);
        assert!(!module.aborted);
    }

    #[tokio::test]
    async fn error_skips_post_process_and_aborts() {
        let (_tx, rx) = watch::channel(false);
        let mut module = Counter {
            stop_after: 10,
            fail_at: Some(2),
            ..Default::default()
        };
        assert!(run_module(&mut module, rx).await.is_err());
        assert!(!module.post);
        assert!(module.aborted);
    }

    #[tokio::test]
    async fn shutdown_signal_ends_loop() {
        let (tx, rx) = watch::channel(false);
        let mut module = Counter {
            stop_after: u32::MAX,
            ..Default::default()
        };
        tx.send(true).unwrap();
        run_module(&mut module, rx).await.unwrap();
        assert!(module.post);
        assert_eq!(module.ticks, 1);
    }

    #[tokio::test]
    async fn dropped_sender_does_not_stop_loop() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let mut module = Counter {
            stop_after: 4,
            ..Default::default()
        };
        run_module(&mut module, rx).await.unwrap();
        assert_eq!(module.ticks, 4);
    }
}
