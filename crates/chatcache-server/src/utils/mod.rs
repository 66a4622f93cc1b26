pub mod clock;
pub mod error;
pub mod token_estimator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ServiceError, ServiceResult, StoreError, StoreResult};
