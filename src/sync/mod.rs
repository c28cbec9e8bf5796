// This module is split into smaller files to keep each file manageable.
// The pieces are `include!`'d so everything remains in `crate::sync`.

pub mod http_transport;

include!("parts/01_prelude.rs");
include!("parts/02_state.rs");
include!("parts/03_mute.rs");
include!("parts/04_codec.rs");
include!("parts/05_watcher.rs");
include!("parts/06_uploader.rs");
include!("parts/07_resolver.rs");
include!("parts/08_realtime.rs");
include!("parts/09_agent.rs");
