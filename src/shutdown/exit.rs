//! Process exit actions.

/// Terminates the process when a forced shutdown is triggered.
///
/// Implementations used in production must not return. Closures taking the
/// exit code implement this trait, which lets tests record the call instead.
pub trait ExitAction: Send + Sync + 'static {
    fn exit(&self, code: i32);
}

impl<F> ExitAction for F
where
    F: Fn(i32) + Send + Sync + 'static,
{
    fn exit(&self, code: i32) {
        self(code)
    }
}

/// Exits via `std::process::exit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl ExitAction for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code)
    }
}
