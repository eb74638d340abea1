//! Shorthands for building and returning [`crate::error::TndError`]s.

/// Builds a [`crate::error::TndError`].
///
/// ```ignore
/// tnd_error!(ErrorKind::InvalidSchema, "Primary key is not declared");
/// tnd_error!(ErrorKind::InvalidSchema, "Primary key is not declared", format!("stream {id}"));
/// tnd_error!(ErrorKind::IoError, "Catalog could not be read", source: err);
/// ```
///
/// `detail = expr` moves an owned value in instead of calling `to_string()` on it.
#[macro_export]
macro_rules! tnd_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::TndError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::TndError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::TndError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::TndError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::TndError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::TndError::from(($kind, $desc, $detail.to_string())).with_source($source)
    };
}

/// Returns early with a [`crate::error::TndError`]. Accepts the arms of [`tnd_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::tnd_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::tnd_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::tnd_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::tnd_error!(
            $kind,
            $desc,
            detail = $detail,
            source: $source
        ))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::tnd_error!($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::tnd_error!(
            $kind,
            $desc,
            $detail,
            source: $source
        ))
    };
}
