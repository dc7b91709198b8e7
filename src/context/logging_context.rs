//! Per-thread logging context (key/value pairs merged into log output).

use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static CONTEXT: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// Copy of the current thread's logging context, or `None` when it is empty.
pub fn copy_current() -> Option<HashMap<String, String>> {
    CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        if ctx.is_empty() {
            None
        } else {
            Some(ctx.clone())
        }
    })
}

/// Replace the current thread's logging context.
pub fn set_map(map: HashMap<String, String>) {
    CONTEXT.with(|ctx| *ctx.borrow_mut() = map);
}

/// Remove and return the current thread's logging context.
pub fn take() -> HashMap<String, String> {
    CONTEXT.with(|ctx| std::mem::take(&mut *ctx.borrow_mut()))
}

pub fn clear() {
    CONTEXT.with(|ctx| ctx.borrow_mut().clear());
}

pub fn put(key: impl Into<String>, value: impl Into<String>) {
    CONTEXT.with(|ctx| {
        ctx.borrow_mut().insert(key.into(), value.into());
    });
}

pub fn get(key: &str) -> Option<String> {
    CONTEXT.with(|ctx| ctx.borrow().get(key).cloned())
}

pub fn remove(key: &str) -> Option<String> {
    CONTEXT.with(|ctx| ctx.borrow_mut().remove(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_clear() {
        clear();
        assert!(copy_current().is_none());

        put("request_id", "abc");
        assert_eq!(get("request_id").as_deref(), Some("abc"));
        assert_eq!(copy_current().unwrap().len(), 1);

        assert_eq!(remove("request_id").as_deref(), Some("abc"));
        assert!(copy_current().is_none());
    }

    #[test]
    fn test_take_leaves_empty_map() {
        set_map(HashMap::from([("a".to_string(), "1".to_string())]));
        let taken = take();
        assert_eq!(taken.get("a").map(String::as_str), Some("1"));
        assert!(copy_current().is_none());
    }
}
