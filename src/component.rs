//! Defines the Component trait, the common shape of every stage that runs on
//! its own thread between two channels. A stage consumes one input at a
//! time and may emit any number of outputs for it, which lets a single
//! serialized stage (like [SensorFusion](crate::sensor_fusion::SensorFusion))
//! own its state outright instead of sharing it behind locks.

use crate::hound_writer::WavError;
use log::{info, warn};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Failures while shutting a stage down.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error(transparent)]
    Wav(#[from] WavError),
}

///
/// A stage of the pipeline. All structs that process a stream of messages
/// on their own thread implement Component, so that they can be started
/// with [run_component].
///
pub trait Component: ToString {
    type InData;
    type OutData;

    /// Converts one input into zero or more outputs
    fn convert(&mut self, input: Self::InData) -> Vec<Self::OutData>;

    /// Cleans up once the input channel has closed
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. Every input received is
/// converted and each resulting output is sent on. The thread ends once all
/// senders of `input` are gone; a closed `output` is logged once and
/// otherwise ignored, since a stage may have side effects beyond its output.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        let mut output_closed = false;
        while let Ok(data) = input.recv() {
            for out_data in component.convert(data) {
                if let Err(error) = output.send(out_data) {
                    if !output_closed {
                        warn!("{} : output closed ({error}).", component.to_string());
                        output_closed = true;
                    }
                }
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!(
                "{} : error during terminating : {component_error}.",
                component.to_string(),
            );
        }
        info!("{} : terminated.", component.to_string());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};

    /// Emits its input plus one, and once more doubled for even inputs
    struct MockComponent {
        finalized: Arc<Mutex<bool>>,
    }

    impl MockComponent {
        fn new() -> Self {
            Self {
                finalized: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl Component for MockComponent {
        type InData = i32;
        type OutData = i32;

        fn convert(&mut self, input: i32) -> Vec<i32> {
            if input % 2 == 0 {
                vec![input + 1, input * 2]
            } else {
                vec![input + 1]
            }
        }

        fn finalize(&mut self) -> Result<(), ComponentError> {
            *self.finalized.lock().unwrap() = true;
            Ok(())
        }
    }

    impl ToString for MockComponent {
        fn to_string(&self) -> String {
            "MockComponent".to_string()
        }
    }

    /// Checks that writing a value to the Component's input produces every
    /// converted value, in order, in the Component's output
    #[test]
    fn test_mock_component() {
        let mock_comp = MockComponent::new();
        let (test_tx, block_rx) = channel::<i32>();
        let (block_tx, test_rx) = channel::<i32>();

        run_component(Box::new(mock_comp), block_rx, block_tx);

        assert_eq!(test_tx.send(2), Ok(()));
        assert_eq!(test_rx.recv(), Ok(3));
        assert_eq!(test_rx.recv(), Ok(4));
        assert_eq!(test_tx.send(1), Ok(()));
        assert_eq!(test_rx.recv(), Ok(2));
    }

    #[test]
    fn test_chained_component() {
        let mock_comp_a = MockComponent::new();
        let mock_comp_b = MockComponent::new();

        let (test_tx, block_a_rx) = channel::<i32>();
        let (block_a_tx, block_b_rx) = channel::<i32>();
        let (block_b_tx, test_rx) = channel::<i32>();

        run_component(Box::new(mock_comp_a), block_a_rx, block_a_tx);
        run_component(Box::new(mock_comp_b), block_b_rx, block_b_tx);

        assert_eq!(test_tx.send(1), Ok(()));
        // 1 -> [2] -> [3, 4]
        assert_eq!(test_rx.recv(), Ok(3));
        assert_eq!(test_rx.recv(), Ok(4));
    }

    #[test]
    fn test_finalize_on_input_close() {
        let mock_comp = MockComponent::new();
        let finalized = mock_comp.finalized.clone();
        let (test_tx, block_rx) = channel::<i32>();
        let (block_tx, test_rx) = channel::<i32>();
        drop(test_rx);

        let handle = run_component(Box::new(mock_comp), block_rx, block_tx);
        assert_eq!(test_tx.send(5), Ok(()));
        drop(test_tx);

        handle.join().unwrap();
        assert!(*finalized.lock().unwrap());
    }
}
