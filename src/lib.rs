//! PrestoPlot: generative grammars for reproducible procedural prose.
//!
//! Grammars are YAML modules of named stanzas. Rendering a module evaluates
//! its start stanza against a shared, seeded context: lists pick
//! alternatives, templates interpolate other stanzas, and Markov stanzas
//! invent names. The same seed always yields the same story.

pub mod core;
