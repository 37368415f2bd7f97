// The fixture helpers live next to the library so its unit tests can use
// them too; every integration test binary includes the same source.
include!("../../src/fixtures.rs");
