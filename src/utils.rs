/// Get environment variable with CASHIER_ prefix, falling back to unprefixed version
///
/// This helper function checks for `CASHIER_{key}` first, then falls back to `{key}`
/// for compatibility with standard environment variable naming.
///
/// # Examples
///
/// ```rust,ignore
/// // Checks CASHIER_STRIPE_SECRET first, then STRIPE_SECRET
/// let secret = get_env_with_prefix("STRIPE_SECRET");
/// ```
pub(crate) fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("CASHIER_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}
