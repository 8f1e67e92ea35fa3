//! Hidden-side half of the rtun reverse tunnel: dials out to the public
//! service, keeps its idle pool topped up, and bridges handed-out
//! connections to a local target service.

pub mod connector;
