use serde::{Deserialize, Serialize};

/// Token counts reported by a provider at end of stream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_fields() {
        let mut acc = TokenUsage::default();
        acc.accumulate(&TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_tokens: 5,
            cache_write_tokens: 0,
        });
        acc.accumulate(&TokenUsage {
            input_tokens: 50,
            output_tokens: 10,
            cache_read_tokens: 0,
            cache_write_tokens: 8,
        });
        assert_eq!(acc.input_tokens, 150);
        assert_eq!(acc.output_tokens, 30);
        assert_eq!(acc.total(), 193);
    }
}
