use deep_harmonization::{OptimizerProgress, ProgressUpdate};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub struct ProgressWindow {
    iteration_pb: ProgressBar,
    evaluation_pb: ProgressBar,

    iteration_len: usize,
    evaluation_len: usize,
}

impl ProgressWindow {
    pub fn new() -> Self {
        let multi_pb = MultiProgress::new();
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len} iterations")
            .progress_chars("##-");

        let iteration_pb = multi_pb.add(ProgressBar::new(100));
        iteration_pb.set_style(sty);

        let sty = ProgressStyle::default_bar()
            .template("            {bar:40.cyan/blue} {pos:>4}/{len} evaluations {msg}")
            .progress_chars("##-");
        let evaluation_pb = multi_pb.add(ProgressBar::new(100));
        evaluation_pb.set_style(sty);

        std::thread::spawn(move || {
            let _ = multi_pb.join();
        });

        Self {
            iteration_pb,
            evaluation_pb,
            iteration_len: 100,
            evaluation_len: 100,
        }
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.iteration_pb.finish();
        self.evaluation_pb.finish();
    }
}

impl OptimizerProgress for ProgressWindow {
    fn update(&mut self, update: ProgressUpdate<'_>) {
        if update.iteration.total != self.iteration_len {
            self.iteration_len = update.iteration.total;
            self.iteration_pb.set_length(self.iteration_len as u64);
        }

        if update.evaluation.total != self.evaluation_len {
            self.evaluation_len = update.evaluation.total;
            self.evaluation_pb.set_length(self.evaluation_len as u64);
        }

        self.iteration_pb.set_position(update.iteration.current as u64);
        self.evaluation_pb
            .set_position(update.evaluation.current.min(self.evaluation_len) as u64);
        self.evaluation_pb.set_message(&format!(
            "style {:.4} content {:.4}",
            update.style_score, update.content_score
        ));
    }
}
