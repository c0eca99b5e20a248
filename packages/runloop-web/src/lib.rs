//! Browser implementations of [`runloop_core::Defer`].
//!
//! The core scheduler only needs "run this once, after the current script
//! yields". In a browser that is either the next animation frame, which
//! batches work with painting, or a zero-delay timer, which also fires in
//! background tabs where animation frames are paused.

use js_sys::Function;
use runloop_core::{Defer, Scheduler, SchedulerConfig, context};
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// Defers onto `requestAnimationFrame`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnimationFrame;

impl Defer for AnimationFrame {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        let Some(window) = web_sys::window() else {
            tracing::error!("no global `window`; deferred task dropped");
            return;
        };
        let callback = Closure::once_into_js(move |_timestamp: f64| task());
        if let Err(err) = window.request_animation_frame(callback.unchecked_ref::<Function>()) {
            tracing::error!(?err, "requestAnimationFrame failed");
        }
    }
}

/// Defers onto `setTimeout`.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    delay_ms: i32,
}

impl Timeout {
    /// One frame at 60Hz, matching animation-frame pacing without pausing in
    /// background tabs.
    pub const FRAME_MS: i32 = 1000 / 60;

    pub fn new(delay_ms: i32) -> Self {
        Self { delay_ms }
    }

    pub fn frame() -> Self {
        Self::new(Self::FRAME_MS)
    }

    pub fn delay_ms(&self) -> i32 {
        self.delay_ms
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Defer for Timeout {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        let Some(window) = web_sys::window() else {
            tracing::error!("no global `window`; deferred task dropped");
            return;
        };
        let callback = Closure::once_into_js(task);
        if let Err(err) = window.set_timeout_with_callback_and_timeout_and_arguments_0(
            callback.unchecked_ref::<Function>(),
            self.delay_ms,
        ) {
            tracing::error!(?err, "setTimeout failed");
        }
    }
}

/// Creates a scheduler that autoruns on animation frames and installs it as
/// this thread's default.
pub fn install(config: SchedulerConfig) -> Rc<Scheduler> {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();

    let scheduler = Scheduler::with_config(config, AnimationFrame);
    if context::install(scheduler.clone()).is_some() {
        console_log("runloop: replaced an existing default scheduler");
    }
    scheduler
}

/// Registers an extra queue on the default scheduler from JavaScript.
#[wasm_bindgen(js_name = addQueue)]
pub fn add_queue(name: String) -> Result<bool, JsValue> {
    context::add_queue(name).map_err(|err| JsValue::from_str(&err.to_string()))
}

fn console_log(s: &str) {
    web_sys::console::log_1(&JsValue::from_str(s));
}
