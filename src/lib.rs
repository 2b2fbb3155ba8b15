pub mod ad;
pub mod error;
pub mod expm;
pub mod hmm;
pub mod inference;
pub mod io;
pub mod pool;
pub mod progress;
pub mod rate;
pub mod sfs;
pub mod transition;
pub mod utils;

pub use ad::Adouble;
pub use error::{EngineError, Result};
pub use inference::InferenceManager;
pub use pool::WorkerPool;
pub use rate::ParameterVector;
