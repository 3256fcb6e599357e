use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use style_synthesis as ss;

pub struct ProgressBars {
    total_pb: ProgressBar,
    evals_pb: ProgressBar,

    total_len: usize,
    evals_len: usize,
}

impl ProgressBars {
    pub fn new() -> Self {
        let multi_pb = MultiProgress::new();
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss {msg}")
            .progress_chars("##-");

        let total_pb = multi_pb.add(ProgressBar::new(1));
        total_pb.set_style(sty);

        let sty = ProgressStyle::default_bar()
            .template("            evals {bar:40.cyan/blue} {pos}/{len}")
            .progress_chars("##-");
        let evals_pb = multi_pb.add(ProgressBar::new(1));
        evals_pb.set_style(sty);

        std::thread::spawn(move || {
            let _ = multi_pb.join();
        });

        Self {
            total_pb,
            evals_pb,
            total_len: 1,
            evals_len: 1,
        }
    }
}

impl Drop for ProgressBars {
    fn drop(&mut self) {
        self.total_pb.finish();
        self.evals_pb.finish();
    }
}

impl ss::GeneratorProgress for ProgressBars {
    fn update(&mut self, update: ss::ProgressUpdate<'_>) {
        if update.total.total != self.total_len {
            self.total_len = update.total.total;
            self.total_pb.set_length(self.total_len as u64);
        }

        if update.evaluations.total != self.evals_len {
            self.evals_len = update.evaluations.total;
            self.evals_pb.set_length(self.evals_len as u64);
        }

        self.total_pb.set_position(update.total.current as u64);
        self.total_pb.set_message(&format!("{:.4e}", update.loss));
        self.evals_pb.set_position(update.evaluations.current as u64);
    }
}
