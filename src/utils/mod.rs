pub mod id;
pub mod kv;
#[cfg(test)]
pub mod test_utils;
pub mod url;
