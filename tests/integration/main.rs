// Integration test suite for the relay's HTTP utility surface.
//
// Organized into focused modules by feature area, mirroring the teacher's layout. All modules
// share the common::test_client helper, which builds a full Rocket instance backed by the
// in-memory RoomStore fake rather than a live external store.

mod common;

mod health_stats;
mod rooms;
