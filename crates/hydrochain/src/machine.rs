//! Pure decision logic.

/// A machine decides, effects execute.
///
/// `decide` performs no IO and does not await; it looks at an input and its
/// own snapshot of state and names the command the caller must carry out.
/// Returning `None` means the input is not meaningful in the current state;
/// callers log it and move on.
pub trait Machine {
    type Event;
    type Command;

    fn decide(&mut self, event: &Self::Event) -> Option<Self::Command>;
}
