mod decode;
mod engine;
mod utils;
