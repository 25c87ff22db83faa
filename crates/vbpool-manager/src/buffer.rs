//! Pure watermark math for the grow and shrink loops.

/// True iff `x` lies on the forward arc from `a` to `b` on a 24-hour
/// cycle, inclusive at both ends.
pub fn point_in_interval24(x: i64, a: i64, b: i64) -> bool {
    (x - a).rem_euclid(24) <= (b - a).rem_euclid(24)
}

/// Maps the pool limit and the current UTC hour to `(low, high)`
/// watermarks.
///
/// Base buffer is 5% of the limit; the ramp-down window halves it, the
/// ramp-up window multiplies it by 1.5. The windows are disjoint by
/// construction; should they ever overlap, ramp-down wins.
pub fn pool_buffers(
    limit_size: u64,
    utc_hour: u32,
    ramp_down: Option<(i64, i64)>,
    ramp_up: Option<(i64, i64)>,
) -> (u64, u64) {
    let hour = i64::from(utc_hour);
    let mut min_buffer = limit_size as f64 * 0.05;

    if ramp_down.is_some_and(|(a, b)| point_in_interval24(hour, a, b)) {
        min_buffer /= 2.0;
    } else if ramp_up.is_some_and(|(a, b)| point_in_interval24(hour, a, b)) {
        min_buffer *= 1.5;
    }

    (min_buffer.ceil() as u64, (min_buffer * 1.5).ceil() as u64)
}
