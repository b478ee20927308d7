use split_first_char::SplitFirstChar;

/// Scope of a package name including the `@`, e.g. `@babel` for `@babel/core`.
pub fn pkg_scope(name: &str) -> Option<&'_ str> {
    match name.split_first_char() {
        Some(('@', rest)) => rest.find('/').map(|index| &name[..index + 1]),
        _ => None,
    }
}

/// Package name without its scope, e.g. `core` for `@babel/core`.
pub fn unscoped_pkg_name(name: &str) -> &'_ str {
    match pkg_scope(name) {
        Some(scope) => &name[scope.len() + 1..],
        None => name,
    }
}
