pub mod helpers;
mod tests_preferred;
