/// Lua script for a coordinated multi-window sliding-window log
///
/// Every window for one identifier is pruned and counted first; the request
/// is inserted into all windows only if each of them still has room, so a
/// deny leaves no speculative member behind in any window.
///
/// KEYS[i]          = sorted-set key of window i
/// ARGV[1]          = current timestamp (epoch milliseconds)
/// ARGV[2 + 3(i-1)] = window length of window i (seconds)
/// ARGV[3 + 3(i-1)] = max requests of window i
/// ARGV[4 + 3(i-1)] = member token for window i
///
/// Returns: pre-insert cardinality of each window, in KEYS order
pub const MULTI_WINDOW_LOG_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local counts = {}
local admit = true

for i, key in ipairs(KEYS) do
    local base = 1 + (i - 1) * 3
    local window = tonumber(ARGV[base + 1])
    local max_requests = tonumber(ARGV[base + 2])

    -- Remove entries older than the window
    redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window * 1000))

    local count = redis.call('ZCARD', key)
    counts[i] = count
    if count + 1 > max_requests then
        admit = false
    end
end

for i, key in ipairs(KEYS) do
    local base = 1 + (i - 1) * 3
    local window = tonumber(ARGV[base + 1])

    if admit then
        redis.call('ZADD', key, now, ARGV[base + 3])
    end
    redis.call('EXPIRE', key, window)
end

return counts
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_is_valid() {
        assert!(MULTI_WINDOW_LOG_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(MULTI_WINDOW_LOG_SCRIPT.contains("ZCARD"));
        assert!(MULTI_WINDOW_LOG_SCRIPT.contains("ZADD"));
        assert!(MULTI_WINDOW_LOG_SCRIPT.contains("EXPIRE"));
    }
}
