pub mod memory_allocation;
pub mod memory_journal;
pub mod memory_membership;
