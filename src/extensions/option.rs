pub trait OptionExt<T> {
    /// Builds `Some` only when `cond` holds.
    fn when<F>(cond: bool, fa: F) -> Option<T>
    where
        F: FnOnce() -> T;

    fn to_result<E, F>(self, on_empty: F) -> Result<T, E>
    where
        F: FnOnce() -> E;
}

impl<T> OptionExt<T> for Option<T> {
    fn when<F>(cond: bool, fa: F) -> Option<T>
    where
        F: FnOnce() -> T,
    {
        if cond {
            Some(fa())
        } else {
            None
        }
    }

    fn to_result<E, F>(self, on_empty: F) -> Result<T, E>
    where
        F: FnOnce() -> E,
    {
        match self {
            Some(v) => Ok(v),
            None => Err(on_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_builds_only_on_true() {
        assert_eq!(Option::when(true, || 5), Some(5));
        assert_eq!(Option::<u8>::when(false, || 5), None);
    }

    #[test]
    fn to_result_maps_empty_to_error() {
        assert_eq!(Some(1).to_result(|| "empty"), Ok(1));
        assert_eq!(None::<u8>.to_result(|| "empty"), Err("empty"));
    }
}
