use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::projection::CaseView;

/// Live callback registration on one case. Dropping it stops the callbacks.
#[derive(Debug)]
pub struct CaseSubscription {
    task: JoinHandle<()>,
}

impl CaseSubscription {
    pub(crate) fn spawn<F>(mut rx: watch::Receiver<CaseView>, callback: F) -> Self
    where
        F: Fn(&CaseView) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            loop {
                let view = rx.borrow_and_update().clone();
                callback(&view);
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for CaseSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
