
mod dependency_cache;
mod run_lifecycle;
mod worker_loop;
