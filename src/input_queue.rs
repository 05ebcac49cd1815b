//! Per-player input queues with frame delay and prediction.

use std::cmp;

use tracing::{trace, warn};

use crate::frame_info::GameInput;
use crate::{Frame, VaultError, VaultResult};

/// The length of the input queue; the number of inputs retained per player.
pub(crate) const INPUT_QUEUE_LENGTH: usize = 128;

/// Whether a returned input is an authoritative value or a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStatus {
    /// The input for this frame was actually received.
    Confirmed,
    /// The input for this frame is predicted from the last confirmed one.
    Predicted,
}

/// `InputQueue` handles the inputs of a single player, stored in a circular
/// array between `head` and `tail`.
///
/// Gaps never exist: inputs added with a raised frame delay are filled by
/// replicating the previous input, and frames requested past the end of the
/// queue are answered with a prediction that repeats the last confirmed
/// input. The queue remembers the earliest frame where such a prediction
/// was later contradicted, which is what triggers a rollback.
#[derive(Debug, Clone)]
pub(crate) struct InputQueue {
    /// Queue id, used for logging only.
    id: usize,
    /// Payload size of every input in this queue.
    input_size: usize,

    /// The head of the queue. The newest input is saved here.
    head: usize,
    /// The tail of the queue. The oldest input still valid is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Whether nothing was ever added, an edge case for head arithmetic.
    first_frame: bool,

    /// The last frame stored in the queue (after delay adjustment).
    last_added_frame: Frame,
    /// The last frame the user handed to `add_input` (before delay).
    last_user_added_frame: Frame,
    /// The earliest frame where a prediction was contradicted by an
    /// authoritative input.
    first_incorrect_frame: Frame,
    /// The last frame that has been requested; nothing at or after it may
    /// be discarded.
    last_requested_frame: Frame,

    /// Inputs added for frame `F` are stored at `F + frame_delay`.
    frame_delay: usize,

    /// The cyclic input storage.
    inputs: Vec<GameInput>,
    /// The active prediction, if any. Its frame advances as confirmed
    /// inputs arrive and validate it.
    prediction: GameInput,
}

impl InputQueue {
    pub(crate) fn new(id: usize, input_size: usize) -> Self {
        Self {
            id,
            input_size,
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            last_user_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            inputs: vec![GameInput::blank(Frame::NULL, input_size); INPUT_QUEUE_LENGTH],
            prediction: GameInput::blank(Frame::NULL, input_size),
        }
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    pub(crate) fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    pub(crate) fn set_frame_delay(&mut self, delay: usize) {
        self.frame_delay = delay;
    }

    /// Clears prediction state from `frame` onward. Any recorded
    /// misprediction is forgotten; by the time this is called the caller
    /// has either rolled back to `frame` or given up on the rollback.
    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        if !self.first_incorrect_frame.is_null() && frame > self.first_incorrect_frame {
            warn!(
                queue = self.id,
                %frame,
                first_incorrect = %self.first_incorrect_frame,
                "resetting prediction past an unresolved misprediction"
            );
        }
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the authoritative input for `requested_frame`, failing if
    /// the frame has not been confirmed. Never returns a prediction.
    pub(crate) fn confirmed_input(&self, requested_frame: Frame) -> VaultResult<GameInput> {
        if let Some(frame) = requested_frame.as_usize() {
            let offset = frame % INPUT_QUEUE_LENGTH;
            if self.inputs[offset].frame == requested_frame {
                return Ok(self.inputs[offset]);
            }
        }
        Err(VaultError::InvalidRequest {
            info: format!(
                "no confirmed input for frame {} in queue {} (tail={}, head={}, length={})",
                requested_frame, self.id, self.tail, self.head, self.length
            ),
        })
    }

    /// Discards confirmed inputs up to `frame`. Confirmed frames are
    /// synchronized between peers, so the bytes are no longer needed —
    /// except for anything at or after the last requested frame, which
    /// future predictions may still be based on.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        // Nothing stored yet; there is nothing to discard, and collapsing
        // an empty queue would mark a blank slot as valid.
        if self.last_added_frame.is_null() {
            return;
        }
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        if frame >= self.last_added_frame {
            // delete all but the most recent
            self.tail = self.head;
            self.length = 1;
        } else if frame <= self.inputs[self.tail].frame {
            // nothing old enough to delete
        } else {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input for `requested_frame`, or a prediction repeating
    /// the last stored input when the frame is past the end of the queue.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> (GameInput, InputStatus) {
        // Fetching inputs while a misprediction is unresolved would walk
        // further down the wrong timeline; rollback must run first.
        assert!(self.first_incorrect_frame.is_null());

        // Remembered so add_input() knows when prediction mode can end and
        // discard_confirmed_frames() knows what must be retained.
        self.last_requested_frame = requested_frame;

        assert!(requested_frame >= self.inputs[self.tail].frame);

        if self.prediction.frame.is_null() {
            // If the requested frame is in our range, fetch it out of the
            // queue and return it.
            let mut offset = (requested_frame - self.inputs[self.tail].frame) as usize;
            if offset < self.length {
                offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                assert!(self.inputs[offset].frame == requested_frame);
                return (self.inputs[offset], InputStatus::Confirmed);
            }

            // The requested frame isn't in the queue. Predict that the
            // player will do the same thing they did last time.
            if requested_frame == 0 || self.last_added_frame.is_null() {
                // no history to base the prediction on
                self.prediction = GameInput::blank(self.prediction.frame, self.input_size);
            } else {
                self.prediction = self.inputs[self.previous_head()];
            }
            self.prediction.frame += 1;
            trace!(
                queue = self.id,
                frame = %requested_frame,
                "entering prediction mode"
            );
        }

        assert!(!self.prediction.frame.is_null());
        let mut predicted = self.prediction;
        predicted.frame = requested_frame;
        (predicted, InputStatus::Predicted)
    }

    /// Adds an input to the queue, subject to the configured frame delay.
    ///
    /// Inputs must be passed in strictly sequentially; anything else is
    /// dropped and `Frame::NULL` is returned. Otherwise returns the frame
    /// the input was actually stored at (`input.frame + frame_delay`).
    pub(crate) fn add_input(&mut self, input: GameInput) -> Frame {
        if !self.last_user_added_frame.is_null()
            && input.frame != self.last_user_added_frame + 1
        {
            warn!(
                queue = self.id,
                frame = %input.frame,
                expected = %(self.last_user_added_frame + 1),
                "dropping out-of-sequence input"
            );
            return Frame::NULL;
        }
        self.last_user_added_frame = input.frame;

        // Move the head to the correct point in preparation for the new
        // input, replicating or dropping if the delay changed.
        let new_frame = self.advance_queue_head(input.frame);
        if !new_frame.is_null() {
            self.add_input_by_frame(input, new_frame);
        }
        new_frame
    }

    /// Stores `input` at `frame_number`. If a prediction exists at that
    /// slot and its bytes differ, the frame is remembered as the first
    /// incorrect one.
    fn add_input_by_frame(&mut self, input: GameInput, frame_number: Frame) {
        let previous_position = self.previous_head();

        assert!(self.last_added_frame.is_null() || frame_number == self.last_added_frame + 1);
        assert!(frame_number == 0 || self.inputs[previous_position].frame == frame_number - 1);

        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        assert!(self.length <= INPUT_QUEUE_LENGTH);
        self.first_frame = false;
        self.last_added_frame = frame_number;

        if !self.prediction.frame.is_null() {
            assert!(frame_number == self.prediction.frame);

            // Remember the first incorrect prediction so the engine can
            // roll back to it.
            if self.first_incorrect_frame.is_null() && !self.prediction.equal(&input, true) {
                trace!(
                    queue = self.id,
                    frame = %frame_number,
                    "prediction contradicted by confirmed input"
                );
                self.first_incorrect_frame = frame_number;
            }

            // If this input is the same frame as the last one requested and
            // nothing was mispredicted, prediction mode can end. Otherwise
            // the prediction keeps chasing the confirmed inputs.
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Advances the head to the next frame, replicating the previous input
    /// into any gap left by a raised frame delay, or dropping the input
    /// entirely when the delay shrank.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            Frame::new(0)
        } else {
            self.inputs[self.previous_head()].frame + 1
        };

        let input_frame = input_frame + self.frame_delay as i32;

        // The frame delay shrank since the last input; there is no room in
        // the queue for this one.
        if expected_frame > input_frame {
            return Frame::NULL;
        }

        // The frame delay grew since the last input; replicate the previous
        // input to fill the space up to the new slot.
        while expected_frame < input_frame {
            let input_to_replicate = self.inputs[self.previous_head()];
            self.add_input_by_frame(input_to_replicate, expected_frame);
            expected_frame += 1;
        }

        assert!(
            input_frame == 0 || input_frame == self.inputs[self.previous_head()].frame + 1
        );
        input_frame
    }

    #[inline]
    fn previous_head(&self) -> usize {
        match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        }
    }
}

// #########
// # TESTS #
// #########


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Sequential adds always store at `frame + delay` and never flag a
        /// misprediction when nothing was predicted.
        #[test]
        fn prop_sequential_adds_accepted(delay in 0usize..8, count in 1i32..60) {
            let mut queue = InputQueue::new(0, 4);
            queue.set_frame_delay(delay);
            for f in 0..count {
                let stored = queue.add_input(GameInput::new(Frame::new(f), &[f as u8, 0, 0, 0]));
                prop_assert_eq!(stored, Frame::new(f + delay as i32));
            }
            prop_assert!(queue.first_incorrect_frame().is_null());
        }

        /// After a reset, the first incorrect frame is always cleared
        /// regardless of what was recorded.
        #[test]
        fn prop_reset_prediction_clears(incorrect_at in 1i32..20) {
            let mut queue = InputQueue::new(0, 4);
            for f in 0..incorrect_at {
                queue.add_input(GameInput::new(Frame::new(f), &[0, 0, 0, 0]));
            }
            let _ = queue.input(Frame::new(incorrect_at));
            queue.add_input(GameInput::new(Frame::new(incorrect_at), &[0xFF, 0, 0, 0]));
            prop_assert_eq!(queue.first_incorrect_frame(), Frame::new(incorrect_at));

            queue.reset_prediction(Frame::new(incorrect_at));
            prop_assert!(queue.first_incorrect_frame().is_null());
        }
    }
}
