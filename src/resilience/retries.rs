//! Retry policy.
//!
//! A request is replayed at most once, and only when it is idempotent and
//! the failure happened before any response byte arrived (write failure or
//! the peer closing a reused connection).

use http::Method;

/// GET, HEAD and PUT are safe to send twice.
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::PUT
}

/// Whether a failed attempt should be replayed.
pub fn should_retry(method: &Method, retryable: bool, attempt: u32) -> bool {
    attempt == 0 && retryable && is_idempotent(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idempotent_methods_retry_once() {
        assert!(should_retry(&Method::GET, true, 0));
        assert!(should_retry(&Method::PUT, true, 0));
        assert!(!should_retry(&Method::GET, true, 1));
        assert!(!should_retry(&Method::GET, false, 0));
        assert!(!should_retry(&Method::POST, true, 0));
        assert!(!should_retry(&Method::DELETE, true, 0));
    }
}
