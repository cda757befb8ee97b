use std::fmt;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Error carrying a dotted code (`relay.config.missing`) alongside a human readable message.
#[derive(Debug)]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: String, message: String) -> Self {
        Self { code, message }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn boxed(code: &str, message: impl Into<String>) -> SendableError {
        Box::new(Self::new(code.to_string(), message.into()))
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
