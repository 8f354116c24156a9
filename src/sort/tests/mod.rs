pub mod helpers;

mod tests_buffer;
