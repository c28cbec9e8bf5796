// This module is split into smaller files to keep each file manageable.
// The pieces are `include!`'d so everything remains in `crate::server`.

include!("parts/01_store.rs");
include!("parts/02_notify.rs");
include!("parts/03_http.rs");
