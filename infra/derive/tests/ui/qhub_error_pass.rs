use qhub_derive::qhub_error;
use std::borrow::Cow;

#[qhub_error]
pub enum DemoError {
    #[error("IO error{}: {source}", format_context(.context))]
    Io {
        #[source]
        source: std::io::Error,
        context: Option<Cow<'static, str>>,
    },

    #[error("Internal error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

fn read() -> Result<Vec<u8>, DemoError> {
    std::fs::read("/definitely/missing").context("Reading fixture")
}

fn main() {
    let err: DemoError = "invariant broken".into();
    assert!(matches!(err, DemoError::Internal { .. }));
    assert!(read().is_err());
}
