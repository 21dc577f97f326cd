//! Progress reporting and cancellation.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use indicatif::ProgressBar;

use crate::{
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// Where a run reports what it is doing, and where it learns that it should
/// stop.
pub trait Feedback: Send + Sync {
    /// Report overall progress, from 0 to 100.
    fn set_progress(&self, percent: f64);

    /// Describe the current step.
    fn set_progress_text(&self, text: &str);

    /// Report something worth showing the user.
    fn push_info(&self, text: &str);

    /// Has the user asked us to stop?
    fn is_canceled(&self) -> bool;
}

/// A shared "please stop" flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has [`CancelFlag::cancel`] been called?
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set this flag on the first Ctrl-C. A second Ctrl-C exits immediately.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Interrupted, stopping after the current feature (press Ctrl-C again to quit)");
            flag.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }
}

/// [`Feedback`] shown as a progress bar, with messages sent to our logs.
pub struct UiFeedback {
    progress: ProgressBar,
    cancel: CancelFlag,
}

impl UiFeedback {
    /// Create a progress bar on `ui`.
    pub fn new(ui: &Ui, cancel: CancelFlag) -> Self {
        let progress = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🔎",
                msg: "Recognizing text",
                done_msg: "Recognized text",
            },
            100,
        );
        Self { progress, cancel }
    }

    /// Stop drawing the progress bar.
    pub fn finish(&self) {
        self.progress.finish_using_style();
    }
}

impl Feedback for UiFeedback {
    fn set_progress(&self, percent: f64) {
        self.progress.set_position(percent.clamp(0.0, 100.0).floor() as u64);
    }

    fn set_progress_text(&self, text: &str) {
        self.progress.set_message(text.to_owned());
    }

    fn push_info(&self, text: &str) {
        info!("{}", text);
    }

    fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records everything reported to it. Cancels itself after `cancel_after`
    /// calls to [`Feedback::is_canceled`], if set.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingFeedback {
        pub(crate) progress: Mutex<Vec<f64>>,
        pub(crate) progress_text: Mutex<Vec<String>>,
        pub(crate) info: Mutex<Vec<String>>,
        pub(crate) cancel_after: Option<usize>,
        pub(crate) polls: Mutex<usize>,
    }

    impl RecordingFeedback {
        pub(crate) fn canceling_after(polls: usize) -> Self {
            Self {
                cancel_after: Some(polls),
                ..Self::default()
            }
        }
    }

    impl Feedback for RecordingFeedback {
        fn set_progress(&self, percent: f64) {
            self.progress.lock().unwrap().push(percent);
        }

        fn set_progress_text(&self, text: &str) {
            self.progress_text.lock().unwrap().push(text.to_owned());
        }

        fn push_info(&self, text: &str) {
            self.info.lock().unwrap().push(text.to_owned());
        }

        fn is_canceled(&self) -> bool {
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            matches!(self.cancel_after, Some(limit) if *polls > limit)
        }
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_canceled());
        flag.cancel();
        assert!(other.is_canceled());
    }

    #[test]
    fn ui_feedback_reads_cancel_flag() {
        let ui = Ui::init_for_tests();
        let cancel = CancelFlag::new();
        let feedback = UiFeedback::new(&ui, cancel.clone());
        feedback.set_progress(50.0);
        feedback.set_progress_text("1/2 id: 7");
        assert!(!feedback.is_canceled());
        cancel.cancel();
        assert!(feedback.is_canceled());
        feedback.finish();
    }
}
