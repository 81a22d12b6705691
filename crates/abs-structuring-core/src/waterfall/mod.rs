pub mod allocator;
pub mod cash_buckets;
pub mod structure;
