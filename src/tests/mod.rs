
mod test_keyed_rate_limiter;
