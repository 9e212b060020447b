//! Order state machine
//!
//! Transition graph:
//!
//! ```text
//! New -> Submitted -> Accepted -> (PartiallyFilled*) -> Filled | Cancelled | Expired
//!          |              |            |
//!          v              v            v
//!       Rejected    CancelRequested -> Cancelled
//! ```
//!
//! A fill may race a cancel: CancelRequested still accepts fills and may
//! terminate Filled, in which case the late cancel ack is ignored.
//! Terminal states are absorbing.

use super::order::OrderState;

/// Validates transitions against the state machine
#[derive(Debug, Clone, Copy, Default)]
pub struct Lifecycle;

impl Lifecycle {
    /// Whether `from -> to` is a legal transition
    #[must_use]
    pub fn is_valid(from: OrderState, to: OrderState) -> bool {
        use OrderState::{
            Accepted, CancelRequested, Cancelled, Expired, Filled, New, PartiallyFilled, Rejected,
            Submitted,
        };
        match from {
            New => matches!(to, Submitted | Rejected),
            Submitted => matches!(to, Accepted | Rejected),
            Accepted => matches!(
                to,
                PartiallyFilled | Filled | CancelRequested | Cancelled | Expired
            ),
            PartiallyFilled => matches!(
                to,
                PartiallyFilled | Filled | CancelRequested | Cancelled | Expired
            ),
            CancelRequested => matches!(to, Cancelled | PartiallyFilled | Filled),
            Filled | Cancelled | Rejected | Expired => false,
        }
    }

    /// Legal successor states of `from`
    #[must_use]
    pub fn successors(from: OrderState) -> Vec<OrderState> {
        use OrderState::{
            Accepted, CancelRequested, Cancelled, Expired, Filled, New, PartiallyFilled, Rejected,
            Submitted,
        };
        [
            New,
            Submitted,
            Accepted,
            PartiallyFilled,
            Filled,
            CancelRequested,
            Cancelled,
            Rejected,
            Expired,
        ]
        .into_iter()
        .filter(|to| Self::is_valid(from, *to))
        .collect()
    }

    /// Whether a cancel request is meaningful in `state`
    #[must_use]
    pub fn can_request_cancel(state: OrderState) -> bool {
        matches!(state, OrderState::Accepted | OrderState::PartiallyFilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderState::*;

    #[test]
    fn happy_path_is_legal() {
        for (from, to) in [
            (New, Submitted),
            (Submitted, Accepted),
            (Accepted, PartiallyFilled),
            (PartiallyFilled, PartiallyFilled),
            (PartiallyFilled, Filled),
        ] {
            assert!(Lifecycle::is_valid(from, to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn cancel_two_phase() {
        assert!(Lifecycle::is_valid(Accepted, CancelRequested));
        assert!(Lifecycle::is_valid(PartiallyFilled, CancelRequested));
        assert!(Lifecycle::is_valid(CancelRequested, Cancelled));
        // Fill racing the cancel may still complete the order.
        assert!(Lifecycle::is_valid(CancelRequested, PartiallyFilled));
        assert!(Lifecycle::is_valid(CancelRequested, Filled));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [Filled, Cancelled, Rejected, Expired] {
            assert!(Lifecycle::successors(terminal).is_empty(), "{terminal:?}");
        }
    }

    #[test]
    fn illegal_jumps_rejected() {
        assert!(!Lifecycle::is_valid(New, Accepted));
        assert!(!Lifecycle::is_valid(New, Filled));
        assert!(!Lifecycle::is_valid(Submitted, PartiallyFilled));
        assert!(!Lifecycle::is_valid(Submitted, CancelRequested));
        assert!(!Lifecycle::is_valid(Filled, Cancelled));
        assert!(!Lifecycle::is_valid(Cancelled, Filled));
    }

    #[test]
    fn cancel_only_meaningful_when_resting() {
        assert!(Lifecycle::can_request_cancel(Accepted));
        assert!(Lifecycle::can_request_cancel(PartiallyFilled));
        assert!(!Lifecycle::can_request_cancel(New));
        assert!(!Lifecycle::can_request_cancel(Submitted));
        assert!(!Lifecycle::can_request_cancel(Filled));
        assert!(!Lifecycle::can_request_cancel(CancelRequested));
    }
}
