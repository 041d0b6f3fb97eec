pub mod capture;
pub mod compilation;
pub mod dispatch;
pub mod handler;
pub mod machine;
pub mod poller;
pub mod runtime;
pub mod session;

pub use capture::{CaptureLayer, CaptureSlot, DrainReport, LogCapture};
pub use compilation::{Blackout, CompilationTracker};
pub use dispatch::{MainContext, MainContextHandle};
pub use handler::{HandlerOutcome, HandlerRegistry, RequestHandler};
pub use machine::{FinishRetry, RequestStateMachine};
pub use poller::{Poller, TickReport};
pub use runtime::{HostRuntime, HostRuntimeBuilder};
pub use session::SessionManager;
