pub mod validate_json;
