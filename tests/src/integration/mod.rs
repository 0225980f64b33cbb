//! Integration scenarios.

pub mod bookkeeping;
pub mod end_to_end;
pub mod ordering;
pub mod shutdown;
