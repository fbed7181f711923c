//! Nested error capture scopes.

use gpuwire_types::{ErrorFilter, ErrorType};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorScope {
    filter: ErrorFilter,
    captured: Option<(ErrorType, String)>,
}

impl ErrorScope {
    fn new(filter: ErrorFilter) -> Self {
        Self {
            filter,
            captured: None,
        }
    }

    pub fn filter(&self) -> ErrorFilter {
        self.filter
    }

    /// `NoError` until something was captured.
    pub fn error_type(&self) -> ErrorType {
        self.captured.as_ref().map_or(ErrorType::NoError, |(ty, _)| *ty)
    }

    pub fn message(&self) -> &str {
        self.captured.as_ref().map_or("", |(_, msg)| msg.as_str())
    }

    pub fn into_result(self) -> (ErrorType, String) {
        self.captured
            .unwrap_or((ErrorType::NoError, String::new()))
    }

    fn capture_first(&mut self, ty: ErrorType, message: &str) {
        if self.captured.is_none() {
            self.captured = Some((ty, message.to_owned()));
        }
    }
}

/// The error scopes pushed by one thread, innermost last.
#[derive(Clone, Debug, Default)]
pub struct ErrorScopeStack {
    scopes: Vec<ErrorScope>,
}

impl ErrorScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: ErrorFilter) {
        self.scopes.push(ErrorScope::new(filter));
    }

    pub fn pop(&mut self) -> Option<ErrorScope> {
        self.scopes.pop()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Routes an error through the scopes, innermost first. Returns `true` if it
    /// also reaches the root, i.e. the device's uncaptured-error handling.
    ///
    /// - `Validation` / `OutOfMemory` stop at the first scope whose filter matches;
    ///   that scope keeps the first error it saw.
    /// - `Internal` is recorded by every scope it passes and stops at the first
    ///   `Internal` filter.
    /// - `Unknown` is recorded by every scope and always reaches the root.
    /// - `DeviceLost` replaces whatever every scope recorded and always reaches
    ///   the root.
    pub fn handle_error(&mut self, ty: ErrorType, message: &str) -> bool {
        match ty {
            ErrorType::NoError => false,
            ErrorType::Validation | ErrorType::OutOfMemory => {
                for scope in self.scopes.iter_mut().rev() {
                    if scope.filter.matches(ty) {
                        scope.capture_first(ty, message);
                        return false;
                    }
                }
                true
            }
            ErrorType::Internal => {
                for scope in self.scopes.iter_mut().rev() {
                    scope.capture_first(ty, message);
                    if scope.filter.matches(ty) {
                        return false;
                    }
                }
                true
            }
            ErrorType::Unknown => {
                for scope in &mut self.scopes {
                    scope.capture_first(ty, message);
                }
                true
            }
            ErrorType::DeviceLost => {
                for scope in &mut self.scopes {
                    if scope.error_type() != ErrorType::DeviceLost {
                        scope.captured = Some((ty, message.to_owned()));
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_error_wins() {
        let mut stack = ErrorScopeStack::new();
        stack.push(ErrorFilter::Validation);
        assert!(!stack.handle_error(ErrorType::Validation, "first"));
        assert!(!stack.handle_error(ErrorType::Validation, "second"));
        let scope = stack.pop().unwrap();
        assert_eq!(scope.error_type(), ErrorType::Validation);
        assert_eq!(scope.message(), "first");
    }

    #[test]
    fn mismatched_filter_passes_error_outward() {
        let mut stack = ErrorScopeStack::new();
        stack.push(ErrorFilter::Validation);
        stack.push(ErrorFilter::OutOfMemory);
        assert!(!stack.handle_error(ErrorType::Validation, "v"));
        let inner = stack.pop().unwrap();
        assert_eq!(inner.error_type(), ErrorType::NoError);
        let outer = stack.pop().unwrap();
        assert_eq!(outer.into_result(), (ErrorType::Validation, "v".to_owned()));
    }

    #[test]
    fn unmatched_errors_reach_the_root() {
        let mut stack = ErrorScopeStack::new();
        assert!(stack.handle_error(ErrorType::Validation, "v"));
        stack.push(ErrorFilter::OutOfMemory);
        assert!(stack.handle_error(ErrorType::Validation, "v"));
        assert!(!stack.handle_error(ErrorType::NoError, ""));
    }

    #[test]
    fn device_lost_overrides_and_propagates() {
        let mut stack = ErrorScopeStack::new();
        stack.push(ErrorFilter::OutOfMemory);
        stack.push(ErrorFilter::Validation);
        stack.handle_error(ErrorType::Validation, "v");
        assert!(stack.handle_error(ErrorType::DeviceLost, "lost"));
        assert!(stack.handle_error(ErrorType::DeviceLost, "lost again"));

        for _ in 0..2 {
            let scope = stack.pop().unwrap();
            assert_eq!(scope.error_type(), ErrorType::DeviceLost);
            assert_eq!(scope.message(), "lost");
        }
    }

    #[test]
    fn internal_is_recorded_until_an_internal_filter() {
        let mut stack = ErrorScopeStack::new();
        stack.push(ErrorFilter::Validation);
        stack.push(ErrorFilter::Internal);
        stack.push(ErrorFilter::OutOfMemory);
        assert!(!stack.handle_error(ErrorType::Internal, "boom"));

        assert_eq!(stack.pop().unwrap().error_type(), ErrorType::Internal);
        assert_eq!(stack.pop().unwrap().error_type(), ErrorType::Internal);
        assert_eq!(stack.pop().unwrap().error_type(), ErrorType::NoError);

        stack.push(ErrorFilter::Validation);
        assert!(stack.handle_error(ErrorType::Internal, "boom"));
        assert_eq!(stack.pop().unwrap().error_type(), ErrorType::Internal);
    }

    #[test]
    fn unknown_is_recorded_everywhere() {
        let mut stack = ErrorScopeStack::new();
        stack.push(ErrorFilter::Validation);
        stack.push(ErrorFilter::OutOfMemory);
        assert!(stack.handle_error(ErrorType::Unknown, "?"));
        assert_eq!(stack.pop().unwrap().error_type(), ErrorType::Unknown);
        assert_eq!(stack.pop().unwrap().error_type(), ErrorType::Unknown);
    }
}
