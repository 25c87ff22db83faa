pub mod room_queue;
pub mod vm_record;

pub use vm_record::VmState;
