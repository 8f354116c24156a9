//! Failure propagation.
//!
//! Coverage:
//! - a mapper error or panic stops the job and surfaces to the caller
//! - malformed mapped records
//! - a reducer error during the merge phase
//! - a sort budget too small for a single index entry
//! - the job directory is removed after every failure

#[cfg(test)]
mod tests {
    use super::super::helpers::*;
    use crate::engine::{Engine, EngineState};
    use crate::key::{Key, KeyType};
    use crate::mapreduce::{Emit, MapReducer};
    use crate::merge::Values;
    use crate::{Error, JobConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn input_with(trigger: &str) -> String {
        let mut text: String = (0..3000).map(|i| format!("line {i}\n")).collect();
        text.push_str(trigger);
        text.push('\n');
        text.extend((0..500).map(|i| format!("tail {i}\n")));
        text
    }

    /// # Scenario
    /// A mapper returns an error part-way through the input.
    ///
    /// # Starting environment
    /// Three workers, small input buffers.
    ///
    /// # Actions
    /// Run a job whose mapper fails on one line.
    ///
    /// # Expected behavior
    /// The mapper's error is returned, the engine is done and the job
    /// directory is gone.
    #[test]
    fn mapper_error_stops_job() {
        let tmp = TempDir::new().unwrap();
        let mut engine = Engine::new(
            small_config(&tmp, 3),
            Arc::new(Faulty {
                trigger: "boom",
                panic: false,
            }),
        )
        .unwrap();

        let input = input_with("boom");
        let mut reader = input.as_bytes();
        let mut sink = Vec::new();
        let result = engine.run(&mut reader, &mut sink);

        match result {
            Err(Error::Task(e)) => assert!(e.to_string().contains("boom")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Done);
        assert_eq!(entries_in(&tmp), 0);
    }

    #[test]
    fn mapper_panic_stops_job() {
        let tmp = TempDir::new().unwrap();
        let job = Faulty {
            trigger: "boom",
            panic: true,
        };
        let result = run_job(small_config(&tmp, 2), Arc::new(job), input_with("boom").as_bytes());
        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(entries_in(&tmp), 0);
    }

    #[test]
    fn malformed_mapped_record() {
        let tmp = TempDir::new().unwrap();
        let result = run_job(
            small_config(&tmp, 2),
            Arc::new(Lines(KeyType::String)),
            b"fine\nkey\twith tab\n",
        );
        assert!(matches!(result, Err(Error::InvalidRecord(_))));
    }

    struct ReduceFails;

    impl MapReducer for ReduceFails {
        fn key_type(&self) -> KeyType {
            KeyType::Int64
        }

        fn map(&self, line: &[u8], out: &mut dyn Emit) -> Result<(), Error> {
            out.emit_key(line)
        }

        fn reduce(&self, key: Key<'_>, values: &mut Values<'_>, out: &mut dyn Emit) -> Result<(), Error> {
            if key.as_i64() == 13 {
                return Err(Error::task("unlucky key"));
            }
            values.drain()?;
            out.emit_key(key.as_bytes())
        }
    }

    #[test]
    fn reducer_error_stops_job() {
        let input: String = (0..100).map(|i| format!("{i}\n")).collect();
        for sort_output in [true, false] {
            let tmp = TempDir::new().unwrap();
            let config = JobConfig {
                sort_output,
                ..small_config(&tmp, 2)
            };
            let result = run_job(config, Arc::new(ReduceFails), input.as_bytes());
            assert!(matches!(result, Err(Error::Task(_))), "sorted={sort_output}");
            assert_eq!(entries_in(&tmp), 0);
        }
    }

    #[test]
    fn sort_budget_too_small() {
        let tmp = TempDir::new().unwrap();
        let config = JobConfig {
            buffer_size: 16,
            ..small_config(&tmp, 2)
        };
        let mut engine = Engine::new(config, Arc::new(Lines(KeyType::String))).unwrap();
        assert!(matches!(
            engine.prepare_input(),
            Err(Error::ResourceExhausted(_))
        ));
        drop(engine);
        assert_eq!(entries_in(&tmp), 0);
    }
}
