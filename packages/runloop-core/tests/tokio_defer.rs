#![cfg(feature = "tokio")]

use runloop_core::{Scheduler, TokioLocalDefer};
use std::cell::Cell;
use std::rc::Rc;
use tokio::task::LocalSet;

#[tokio::test]
async fn test_autorun_on_local_set() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let scheduler = Scheduler::new(TokioLocalDefer);
            let hits = Rc::new(Cell::new(0));

            for _ in 0..3 {
                let h = hits.clone();
                scheduler
                    .schedule_once("sync", None, Some("tick"), move |_| {
                        h.set(h.get() + 1);
                        Ok(())
                    })
                    .unwrap();
            }
            assert_eq!(hits.get(), 0);

            for _ in 0..10 {
                if !scheduler.is_running() {
                    break;
                }
                tokio::task::yield_now().await;
            }

            assert_eq!(hits.get(), 1);
            assert!(!scheduler.is_running());
        })
        .await;
}
