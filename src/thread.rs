//! The dedicated render thread and its paint scheduling.
//!
//! Producers call [`RenderThread::notify_paint`] whenever the payload
//! changed; any number of notifications coalesce into one pending paint.
//! The state moves to `Waiting` before the paint runs, so a notification
//! arriving mid-paint lands as a fresh `PaintRequested` that the loop picks
//! up immediately after, never going to sleep with work pending.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Paint notifications are ignored (e.g. the window is minimized).
    Disabled,
    Waiting,
    PaintRequested,
    ExitRequested,
}

/// What the render thread drives. Implemented by the renderer that owns the
/// backend; both calls happen exclusively on the render thread.
pub trait RenderLoop: Send + 'static {
    /// Block until the presentation target can take another frame.
    fn wait_until_can_render(&mut self);
    /// Render and present one frame.
    fn paint(&mut self);
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// Owns the render thread; dropping it requests exit and joins.
pub struct RenderThread {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Spawn the thread. Painting starts disabled; call
    /// [`enable_painting`](Self::enable_painting) once a target exists.
    pub fn spawn<L: RenderLoop>(render_loop: L) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Disabled),
            condvar: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("render".into())
            .spawn(move || Self::run(&thread_shared, render_loop))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn run<L: RenderLoop>(shared: &Shared, mut render_loop: L) {
        loop {
            {
                let mut state = shared.state.lock();
                loop {
                    match *state {
                        State::ExitRequested => return,
                        State::PaintRequested => {
                            *state = State::Waiting;
                            break;
                        }
                        State::Disabled | State::Waiting => shared.condvar.wait(&mut state),
                    }
                }
            }

            render_loop.wait_until_can_render();
            render_loop.paint();
            // Re-check immediately: a notify that arrived during the paint
            // set PaintRequested again and must not wait for another one.
        }
    }

    /// Request a paint. Coalesces: many notifications before the thread
    /// wakes produce one frame. Ignored while painting is disabled.
    pub fn notify_paint(&self) {
        let mut state = self.shared.state.lock();
        if *state == State::Waiting {
            *state = State::PaintRequested;
            self.shared.condvar.notify_one();
        }
    }

    pub fn enable_painting(&self) {
        let mut state = self.shared.state.lock();
        if *state == State::Disabled {
            *state = State::Waiting;
            self.shared.condvar.notify_one();
        }
    }

    /// Stop reacting to paint notifications. A paint already in flight
    /// still completes.
    pub fn disable_painting(&self) {
        let mut state = self.shared.state.lock();
        if *state != State::ExitRequested {
            *state = State::Disabled;
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            *state = State::ExitRequested;
            self.shared.condvar.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingLoop {
        paints: Arc<AtomicUsize>,
        painted_tx: mpsc::Sender<()>,
    }

    impl RenderLoop for CountingLoop {
        fn wait_until_can_render(&mut self) {}
        fn paint(&mut self) {
            self.paints.fetch_add(1, Ordering::SeqCst);
            let _ = self.painted_tx.send(());
        }
    }

    fn counting_thread() -> (RenderThread, Arc<AtomicUsize>, mpsc::Receiver<()>) {
        let paints = Arc::new(AtomicUsize::new(0));
        let (painted_tx, painted_rx) = mpsc::channel();
        let thread = RenderThread::spawn(CountingLoop {
            paints: Arc::clone(&paints),
            painted_tx,
        })
        .unwrap();
        (thread, paints, painted_rx)
    }

    #[test]
    fn notifications_are_ignored_while_disabled() {
        let (thread, paints, painted_rx) = counting_thread();
        thread.notify_paint();
        thread.notify_paint();
        assert!(
            painted_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "painted while disabled"
        );
        assert_eq!(paints.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_notify_paints_exactly_once() {
        let (thread, paints, painted_rx) = counting_thread();
        thread.enable_painting();
        thread.notify_paint();
        painted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no paint happened");
        // Allow any (incorrect) extra paint to land before counting.
        assert!(painted_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(paints.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifies_coalesce_but_never_get_lost() {
        let (thread, paints, painted_rx) = counting_thread();
        thread.enable_painting();
        for _ in 0..50 {
            thread.notify_paint();
        }
        painted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no paint happened");
        // A burst must produce at least one frame and far fewer than one
        // frame per notification.
        while painted_rx.recv_timeout(Duration::from_millis(100)).is_ok() {}
        let count = paints.load(Ordering::SeqCst);
        assert!(count >= 1 && count <= 50);

        // And a fresh notify after the burst still paints.
        let before = paints.load(Ordering::SeqCst);
        thread.notify_paint();
        painted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("post-burst notify lost");
        assert!(paints.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn drop_joins_the_thread() {
        let (thread, _, _rx) = counting_thread();
        thread.enable_painting();
        drop(thread);
    }
}
