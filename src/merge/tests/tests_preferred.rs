//! Preferred output sink.
//!
//! Coverage:
//! - an idle sink takes every reduced chunk, leaving the run empty
//! - a busy sink declines immediately instead of blocking
//! - a merge that finds the sink busy keeps its records in the run

#[cfg(test)]
mod tests {
    use super::super::helpers::*;
    use crate::key::KeyType;
    use crate::merge::{Merger, PreferredOutput};
    use crossbeam::channel::{self, Receiver, Sender};
    use std::io::{self, Write};
    use tempfile::TempDir;

    /// Blocks inside `write` until released.
    struct GateSink {
        entered: Sender<()>,
        release: Receiver<()>,
        data: Vec<u8>,
    }

    impl Write for GateSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn input_runs(settings: &crate::run::RunSettings) -> Vec<crate::run::Run> {
        (0..4)
            .map(|r| {
                let records = (0..100).map(|i| (format!("w{:02}", i % 25), "1".to_string())).collect();
                write_run(settings, &format!("in{r}"), records)
            })
            .collect()
    }

    #[test]
    fn idle_sink_takes_everything() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, KeyType::String, false, false);
        let reducer = Sum::new(true);

        let mut sink: Vec<u8> = Vec::new();
        let preferred = PreferredOutput::new(&mut sink);
        let run = Merger::new(&settings, &reducer, input_runs(&settings), 3, 0)
            .merge_to_single(true, Some(&preferred))
            .unwrap()
            .unwrap();
        assert!(preferred.bytes_written() > 0);
        assert_eq!(preferred.declined(), 0);
        drop(preferred);

        assert!(read_run(run, &settings).is_empty());
        let lines = parse_lines(&sink);
        assert_eq!(lines.len(), 25);
        assert!(lines.iter().all(|(_, v)| v == "16"));
    }

    /// # Scenario
    /// Another merge holds the preferred sink.
    ///
    /// # Starting environment
    /// A sink whose `write` blocks until the test releases it; a helper
    /// thread is parked inside it.
    ///
    /// # Actions
    /// 1. `try_write` from the test thread.
    /// 2. Run a reducing `merge_to_single` with the same preferred sink.
    ///
    /// # Expected behavior
    /// `try_write` returns `false` at once and the merge writes all its
    /// records to its own run.
    #[test]
    fn busy_sink_falls_back_to_run() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp, KeyType::String, false, false);
        let reducer = Sum::new(false);
        let runs = input_runs(&settings);

        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let mut sink = GateSink {
            entered: entered_tx,
            release: release_rx,
            data: Vec::new(),
        };

        let preferred = PreferredOutput::new(&mut sink);
        let run = crossbeam::scope(|s| {
            let holder = s.spawn(|_| preferred.try_write(b"held\n").unwrap());
            entered_rx.recv().unwrap();

            assert!(!preferred.try_write(b"other\n").unwrap());
            let run = Merger::new(&settings, &reducer, runs, 3, 0)
                .merge_to_single(true, Some(&preferred))
                .unwrap()
                .unwrap();

            drop(release_tx);
            assert!(holder.join().unwrap());
            run
        })
        .unwrap();

        assert!(preferred.declined() >= 2);
        assert_eq!(preferred.bytes_written(), 5);
        drop(preferred);
        assert_eq!(sink.data, b"held\n");

        let records = read_run(run, &settings);
        assert_eq!(records.len(), 25);
        assert_eq!(reducer.calls(), 25);
    }
}
