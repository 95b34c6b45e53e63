//! Address, UUID, status and scan-record primitives shared by the adapter
//! and scheduler crates. No scheduling logic lives here.

pub mod address;
pub mod scan_record;
pub mod status;
pub mod uuid;

pub use address::{DisplayAddress, RawAddress};
pub use scan_record::ScanRecord;
pub use status::GattError;
pub use uuid::{DisplayUuid, Uuid};
