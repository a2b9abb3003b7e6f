pub mod show_cache;
