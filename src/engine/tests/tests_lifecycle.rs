//! Engine lifecycle.
//!
//! Coverage:
//! - operations called out of order fail with `InvalidState`
//! - a map-only job followed by a reduce-only job over the same directory
//! - reduce-only configuration errors

#[cfg(test)]
mod tests {
    use super::super::helpers::*;
    use crate::buffer::RecordBuffer;
    use crate::engine::{Engine, EngineState};
    use crate::jobs::WordCount;
    use crate::key::KeyType;
    use crate::run::parse_sort_run_bucket;
    use crate::{Error, JobConfig};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn out_of_order_calls() {
        let tmp = TempDir::new().unwrap();
        let mut engine =
            Engine::new(small_config(&tmp, 2), Arc::new(Lines(KeyType::String))).unwrap();
        let mut sink = Vec::new();

        assert!(matches!(
            engine.complete_input(RecordBuffer::with_capacity(64)),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            engine.provide_input_data(RecordBuffer::with_capacity(64)),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(engine.reduce(&mut sink), Err(Error::InvalidState(_))));
        assert_eq!(engine.state(), EngineState::Unprepared);

        let buffer = engine.prepare_input().unwrap();
        assert!(matches!(engine.prepare_input(), Err(Error::InvalidState(_))));
        assert!(matches!(engine.reduce(&mut sink), Err(Error::InvalidState(_))));

        engine.complete_input(buffer).unwrap();
        engine.reduce(&mut sink).unwrap();
        assert!(sink.is_empty());
        assert!(matches!(engine.reduce(&mut sink), Err(Error::InvalidState(_))));
    }

    /// # Scenario
    /// Splitting a job into a map-only and a reduce-only run.
    ///
    /// # Starting environment
    /// A named job directory below a temporary work directory.
    ///
    /// # Actions
    /// Map with two workers, then reduce the left runs with three.
    ///
    /// # Expected behavior
    /// The map-only job leaves sort runs behind and writes nothing; the
    /// reduce-only job produces the full word count and removes the
    /// directory.
    #[test]
    fn map_only_then_reduce_only() {
        let tmp = TempDir::new().unwrap();
        let text = random_text(9, 1500, 250);

        let map_config = JobConfig {
            map_only: true,
            subdir: Some("wc".into()),
            ..small_config(&tmp, 2)
        };
        let mut engine = Engine::new(map_config, Arc::new(WordCount)).unwrap();
        let mut reader = text.as_bytes();
        let mut sink = Vec::new();
        let stats = engine.run(&mut reader, &mut sink).unwrap();
        assert!(sink.is_empty());
        assert_eq!(stats.cached_runs, 0);
        assert_eq!(engine.state(), EngineState::Done);
        assert!(matches!(engine.reduce(&mut sink), Err(Error::InvalidState(_))));
        drop(engine);

        let job_dir = tmp.path().join("wc");
        let names: Vec<String> = fs::read_dir(&job_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), stats.spilled_runs);
        assert!(names.iter().all(|n| parse_sort_run_bucket(n).is_some()));

        let reduce_config = JobConfig {
            reduce_only: true,
            sort_output: true,
            subdir: Some("wc".into()),
            ..small_config(&tmp, 3)
        };
        let mut engine = Engine::new(reduce_config, Arc::new(WordCount)).unwrap();
        let mut ignored = &b"ignored\n"[..];
        engine.run(&mut ignored, &mut sink).unwrap();

        assert_eq!(lines(&sink), reference_counts(&text));
        assert!(!job_dir.exists());
    }

    #[test]
    fn reduce_only_needs_existing_dir() {
        let tmp = TempDir::new().unwrap();
        let config = JobConfig {
            reduce_only: true,
            subdir: Some("missing".into()),
            ..small_config(&tmp, 2)
        };
        assert!(matches!(
            Engine::new(config, Arc::new(WordCount)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn reduce_only_rejects_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let job_dir = tmp.path().join("job");
        fs::create_dir(&job_dir).unwrap();
        fs::write(job_dir.join("notes.txt"), b"not a run\n").unwrap();

        let config = JobConfig {
            reduce_only: true,
            subdir: Some("job".into()),
            ..small_config(&tmp, 2)
        };
        let mut engine = Engine::new(config, Arc::new(WordCount)).unwrap();
        let mut sink = Vec::new();
        assert!(matches!(engine.reduce(&mut sink), Err(Error::InvalidConfig(_))));
        assert!(matches!(engine.prepare_input(), Err(Error::InvalidState(_))));
        drop(engine);

        assert!(job_dir.join("notes.txt").exists());
    }
}
