pub mod coordinator;
pub mod direct;
pub mod dispatcher;
pub mod input;

pub use coordinator::DeviceContext;
pub use direct::DirectExecutor;
pub use dispatcher::{DesktopOperator, Operator, OperatorOutcome};
pub use input::{EnigoDriver, InputDriver, InputEvent};
