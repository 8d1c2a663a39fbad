//! A single-writer, single-reader "latest value" slot.
//!
//! A thin wrapper over a triple buffer. The writer owns one buffer, the
//! reader owns another, and the third sits in the middle waiting to be
//! picked up, so neither side ever waits on the other and the reader can
//! never observe a half-written value.
//!
//! The real-time render thread sits on the reader side. Nothing on that side
//! allocates, locks, or blocks.

use triple_buffer::{Input, Output, TripleBuffer};

/// Creates a slot holding `initial` and returns its two halves.
pub fn triple_buffer<T: Clone + Send>(initial: T) -> (SlotWriter<T>, SlotReader<T>) {
    let (input, output) = TripleBuffer::new(&initial).split();
    (SlotWriter { input }, SlotReader { output })
}

/// The publishing half of the slot.
pub struct SlotWriter<T: Send> {
    input: Input<T>,
}

impl<T: Send> SlotWriter<T> {
    /// Replaces the published value wholesale.
    pub fn write(&mut self, value: T) {
        self.input.write(value);
    }

    /// Fills the writer's private buffer in place, then publishes it.
    ///
    /// The buffer handed to `fill` holds an older value (whatever was
    /// published two swaps ago); `fill` must overwrite every field it cares
    /// about. This lets large payloads be refreshed without reallocating.
    pub fn write_with<F>(&mut self, fill: F)
    where
        F: FnOnce(&mut T),
    {
        fill(self.input.input_buffer());
        self.input.publish();
    }
}

/// The consuming half of the slot.
pub struct SlotReader<T: Send> {
    output: Output<T>,
}

impl<T: Send> SlotReader<T> {
    /// Returns the most recently published value. Wait-free.
    pub fn read(&mut self) -> &T {
        self.output.read()
    }

    /// True if the writer published since the last [read](Self::read).
    pub fn has_update(&self) -> bool {
        self.output.updated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reader_sees_initial_value() {
        let (_writer, mut reader) = triple_buffer(7_u32);
        assert!(!reader.has_update());
        assert_eq!(*reader.read(), 7);
    }

    #[test]
    fn reader_sees_latest_of_many_writes() {
        let (mut writer, mut reader) = triple_buffer(0_u32);
        for v in 1..=5 {
            writer.write(v);
        }
        assert!(reader.has_update());
        assert_eq!(*reader.read(), 5);
        assert!(!reader.has_update());
        assert_eq!(*reader.read(), 5);
    }

    #[test]
    fn interleaved_writes_and_reads() {
        let (mut writer, mut reader) = triple_buffer(String::from("a"));
        writer.write("b".to_owned());
        assert_eq!(reader.read(), "b");
        writer.write("c".to_owned());
        writer.write("d".to_owned());
        assert_eq!(reader.read(), "d");
        writer.write_with(|s| {
            s.clear();
            s.push('e');
        });
        assert_eq!(reader.read(), "e");
    }

    #[derive(Clone)]
    struct Block {
        generation: u64,
        samples: Vec<u64>,
    }

    /// One thread publishes blocks whose every sample equals the block's
    /// generation; the other checks that every block it reads is uniform and
    /// that generations never go backwards.
    #[test]
    fn concurrent_reader_never_sees_a_torn_block() {
        const WRITES: u64 = 200_000;
        const LEN: usize = 256;

        let (mut writer, mut reader) = triple_buffer(Block {
            generation: 0,
            samples: vec![0; LEN],
        });

        let producer = thread::spawn(move || {
            for generation in 1..=WRITES {
                writer.write_with(|block| {
                    block.generation = generation;
                    block.samples.iter_mut().for_each(|s| *s = generation);
                });
            }
        });

        let mut last_seen = 0;
        loop {
            let block = reader.read();
            assert!(block.generation >= last_seen);
            assert!(
                block.samples.iter().all(|&s| s == block.generation),
                "torn block at generation {}",
                block.generation
            );
            last_seen = block.generation;
            if last_seen == WRITES {
                break;
            }
            if producer.is_finished() && !reader.has_update() && last_seen != WRITES {
                // the final publish must still be visible
                assert_eq!(reader.read().generation, WRITES);
                break;
            }
        }

        producer.join().unwrap();
    }
}
