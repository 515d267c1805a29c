//! Cross-module scenarios exercised through the public API

mod test_cache;
mod test_config;
mod test_planner;
mod test_planpreview;
mod test_trigger;
