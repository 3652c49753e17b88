use qhub_derive::qhub_error;
use std::borrow::Cow;
use std::sync::Arc;

#[derive(Clone)]
#[qhub_error]
pub enum SharedError {
    #[error("IO error{}: {source}", format_context(.context))]
    Io { source: Arc<std::io::Error>, context: Option<Cow<'static, str>> },

    #[error("Aborted{}: {message}", format_context(.context))]
    Abort { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
}

fn open() -> Result<(), SharedError> {
    std::fs::read_dir("/definitely/missing")?;
    Ok(())
}

fn main() {
    let err = open().expect_err("missing directory");
    let copy = err.clone();
    assert_eq!(err.to_string(), copy.to_string());

    let with_context: Result<(), SharedError> =
        Err(std::io::Error::other("boom")).context("Scanning origins");
    assert!(with_context.unwrap_err().to_string().contains("Scanning origins"));
}
