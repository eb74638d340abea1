use std::fmt;
use std::io;
use std::str::FromStr;

/// Variable naming the runtime environment.
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

const DEV_ENV_NAME: &str = "dev";

const PROD_ENV_NAME: &str = "prod";

/// Runtime environment of the engine.
///
/// Picks the configuration overlay file and the log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

impl Environment {
    /// Reads `APP_ENVIRONMENT`; unset means [`Environment::Dev`].
    pub fn load() -> Result<Environment, io::Error> {
        match std::env::var(APP_ENVIRONMENT_ENV_NAME) {
            Ok(name) => name.parse(),
            Err(_) => Ok(Environment::default()),
        }
    }

    /// Exports this environment as `APP_ENVIRONMENT`.
    ///
    /// Only call it before other threads read the process environment.
    pub fn set(&self) {
        unsafe { std::env::set_var(APP_ENVIRONMENT_ENV_NAME, self.as_str()) }
    }

    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod)
    }

    /// Name used for the overlay file, e.g. `prod.yaml`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => DEV_ENV_NAME,
            Environment::Prod => PROD_ENV_NAME,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = io::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name.eq_ignore_ascii_case(DEV_ENV_NAME) {
            Ok(Self::Dev)
        } else if name.eq_ignore_ascii_case(PROD_ENV_NAME) {
            Ok(Self::Prod)
        } else {
            Err(io::Error::other(format!(
                "unknown environment `{name}`, expected `{DEV_ENV_NAME}` or `{PROD_ENV_NAME}`"
            )))
        }
    }
}
