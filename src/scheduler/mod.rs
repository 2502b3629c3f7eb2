pub mod compiler;
pub mod placement;
pub mod queue;
pub mod registry;
pub mod reservation;

pub use compiler::{CompileOutcome, Compiler};
pub use placement::{Placement, PlacementPolicy, ProgramProbe};
pub use queue::DispatchQueue;
pub use registry::{Upsert, WorkerRegistry, WorkerSnapshot};
pub use reservation::ReservationTable;
