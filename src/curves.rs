//! Piecewise-linear curve types and the closed deterministic-network-calculus
//! operator set shared by the analysis engine and the compactor.
//!
//! Arrival curves are concave piecewise-linear upper bounds on cumulative work,
//! stored as point+slope segments beginning with an implicit instantaneous
//! burst (a segment of infinite slope at the origin). Service curves are
//! simplified to a rate with a delay. All operators stay closed over these two
//! forms so latency queries reduce to a handful of arithmetic steps.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// One piecewise-linear segment: the line of the given slope passing through
/// `(x, y)`, valid from `x` until the next segment's `x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub x: f64,
    pub y: f64,
    pub slope: f64,
}

impl Segment {
    pub fn new(x: f64, y: f64, slope: f64) -> Segment {
        Segment { x, y, slope }
    }

    /// The implicit instantaneous-burst segment every arrival curve starts with.
    pub fn origin() -> Segment {
        Segment::new(0.0, 0.0, f64::INFINITY)
    }
}

/// A piecewise-linear curve as an ordered list of segments.
pub type Curve = Vec<Segment>;

/// Simple arrival curve `A(t) = rate * t + burst`, i.e. a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TokenBucket {
    pub rate: f64,
    pub burst: f64,
}

impl TokenBucket {
    pub const ZERO: TokenBucket = TokenBucket {
        rate: 0.0,
        burst: 0.0,
    };

    pub fn new(rate: f64, burst: f64) -> TokenBucket {
        TokenBucket { rate, burst }
    }

    /// A shaper is active once the optimizer has written real parameters into it.
    pub fn is_zero(&self) -> bool {
        self.rate == 0.0 && self.burst == 0.0
    }
}

/// Simple service curve `S(t) = max(0, rate * (t - delay))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLatency {
    pub rate: f64,
    pub delay: f64,
}

impl RateLatency {
    /// Constant-rate service of a queue with the given bandwidth.
    pub fn constant(bandwidth: f64) -> RateLatency {
        RateLatency {
            rate: bandwidth,
            delay: 0.0,
        }
    }
}

/// Aggregation of two arrival curves.
pub fn aggregate(a: &TokenBucket, b: &TokenBucket) -> TokenBucket {
    TokenBucket {
        rate: a.rate + b.rate,
        burst: a.burst + b.burst,
    }
}

/// Convolution of two service curves.
pub fn convolve(s: &RateLatency, t: &RateLatency) -> RateLatency {
    RateLatency {
        rate: s.rate.min(t.rate),
        delay: s.delay + t.delay,
    }
}

/// Departure bound of arrival `a` after passing through service `s`; the burst
/// grows by the arrival rate times the service delay.
pub fn output(a: &TokenBucket, s: &RateLatency) -> TokenBucket {
    TokenBucket {
        rate: a.rate,
        burst: a.burst + a.rate * s.delay,
    }
}

/// Service remaining once `s` has accounted for cross traffic `a`.
///
/// Overcommitment (`s.rate <= a.rate`) degenerates to a service curve with an
/// infinite delay so that downstream latency bounds evaluate to infinity
/// instead of failing; admission logic treats infinity as an SLO miss.
pub fn leftover(a: &TokenBucket, s: &RateLatency) -> RateLatency {
    let rate = s.rate - a.rate;
    if rate <= 0.0 || !s.delay.is_finite() {
        return RateLatency {
            rate: rate.max(0.0),
            delay: f64::INFINITY,
        };
    }
    RateLatency {
        rate,
        delay: s.delay + (a.burst + a.rate * s.delay) / rate,
    }
}

/// Worst-case latency for arrival `a` under service `s`.
pub fn latency_bound(a: &TokenBucket, s: &RateLatency) -> f64 {
    if a.rate > s.rate || !s.delay.is_finite() || s.rate == 0.0 {
        f64::INFINITY
    } else {
        s.delay + a.burst / s.rate
    }
}

/// Return x-intercept of a line with a given slope passing through (x, y).
pub fn x_intercept(x: f64, y: f64, slope: f64) -> f64 {
    x - y / slope
}

/// Return y-intercept of a line with a given slope passing through (x, y).
pub fn y_intercept(x: f64, y: f64, slope: f64) -> f64 {
    y - slope * x
}

/// Intersection of the lines through two point-slope segments.
///
/// The result keeps the slope of `p1`; an infinite-slope segment is treated as
/// a vertical line. Equal slopes return `p1` unchanged.
pub fn intersection(p1: &Segment, p2: &Segment) -> Segment {
    let mut point = *p1;
    if p1.slope != p2.slope {
        if p1.slope.is_infinite() {
            point.x = p1.x;
            point.y = p2.y - p2.slope * (p2.x - p1.x);
        } else if p2.slope.is_infinite() {
            point.x = p2.x;
            point.y = p1.y - p1.slope * (p1.x - p2.x);
        } else {
            // y = m1 x + b1 and y = m2 x + b2 meet at x = (b2 - b1) / (m1 - m2)
            let b1 = y_intercept(p1.x, p1.y, p1.slope);
            let b2 = y_intercept(p2.x, p2.y, p2.slope);
            point.x = (b2 - b1) / (p1.slope - p2.slope);
            point.y = p1.slope * point.x + b1;
        }
    }
    point
}

/// Worst-case latency between a piecewise arrival curve and a piecewise
/// service curve: the maximum horizontal distance between them.
///
/// For piecewise-linear concave/convex curves the extremum occurs at a vertex
/// of one of the curves, so both vertex lists are walked in y-order and the
/// horizontal gap is evaluated at each vertex. Ties in y advance both cursors.
pub fn curve_latency(arrival: &Curve, service: &Curve) -> f64 {
    let mut max_latency = 0.0f64;
    let mut ai = 0;
    let mut si = 0;
    while ai < arrival.len() || si < service.len() {
        let arrival_y = arrival.get(ai).map_or(f64::INFINITY, |p| p.y);
        let service_y = service.get(si).map_or(f64::INFINITY, |p| p.y);
        let latency = if arrival_y < service_y {
            let ap = &arrival[ai];
            let sp = &service[si - 1];
            let dx = (ap.y - sp.y) / sp.slope;
            ai += 1;
            (sp.x + dx) - ap.x
        } else if arrival_y > service_y {
            let ap = &arrival[ai - 1];
            let sp = &service[si];
            let dx = (sp.y - ap.y) / ap.slope;
            si += 1;
            sp.x - (ap.x + dx)
        } else {
            let latency = service[si].x - arrival[ai].x;
            ai += 1;
            si += 1;
            latency
        };
        if latency > max_latency {
            max_latency = latency;
        }
    }
    max_latency
}

/// Latency a workload experiences inside its own (rate, burst) shaper before
/// entering the first shared queue.
pub fn shaper_latency(arrival: &Curve, shaper: &TokenBucket) -> f64 {
    let service = vec![
        Segment::origin(),
        Segment::new(0.0, shaper.burst, shaper.rate),
    ];
    curve_latency(arrival, &service)
}

/// One request of a time-ordered trace, reduced to its arrival time and the
/// work it demands (see the estimator module for the size-to-work mapping).
#[derive(Debug, Clone, Copy)]
pub struct TraceEntry {
    pub arrival_time: f64,
    pub work: f64,
}

/// Average rate needed to sustain a trace (total work over total duration).
pub fn min_sustained_rate(entries: &[TraceEntry]) -> f64 {
    let Some(first) = entries.first() else {
        tracing::warn!("empty trace");
        return 0.0;
    };
    let total: f64 = entries.iter().map(|e| e.work).sum();
    let duration = entries.last().unwrap().arrival_time - first.arrival_time;
    total / duration
}

/// Simulate a virtual token bucket per candidate rate over a trace, recording
/// the maximum fill each bucket reaches. `rates` must be decreasing; the
/// returned bursts are parallel to `rates`.
pub fn rb_gen(entries: &[TraceEntry], rates: &[f64]) -> Vec<f64> {
    let mut fill = vec![0.0f64; rates.len()];
    let mut bursts = vec![0.0f64; rates.len()];
    let mut prev_time = 0.0;
    for entry in entries {
        let interarrival = entry.arrival_time - prev_time;
        for (k, &rate) in rates.iter().enumerate() {
            // Drain for the elapsed time, then add the request's work.
            fill[k] = (fill[k] - rate * interarrival).max(0.0) + entry.work;
            if fill[k] > bursts[k] {
                bursts[k] = fill[k];
            }
        }
        prev_time = entry.arrival_time;
    }
    bursts
}

/// Build the concave lower envelope of a set of (rate, burst) lines.
///
/// `rates` must be decreasing and `bursts` parallel to it. Each line is
/// intersected with the running last segment, popping segments that the new
/// line renders redundant, until a valid successor is produced.
pub fn rb_curve_to_arrival_curve(rates: &[f64], bursts: &[f64]) -> Curve {
    let mut curve = vec![Segment::origin()];
    for (k, &rate) in rates.iter().enumerate() {
        let mut point = Segment::new(0.0, bursts[k], rate);
        while curve.len() > 1 {
            let last = *curve.last().unwrap();
            let cross = intersection(&point, &last);
            if cross.x > last.x {
                point = cross;
                break;
            }
            curve.pop();
        }
        curve.push(point);
    }
    curve
}

/// Segments whose x exceeds this are dropped first when pruning; latencies
/// that far out are irrelevant to any realistic SLO.
const PRUNE_X_THRESHOLD: f64 = 30.0;

/// Approximate an arrival curve by one with at most `n` points (not counting
/// the initial origin segment).
///
/// High-x segments beyond [`PRUNE_X_THRESHOLD`] go first; after that the
/// internal segment with the smallest y-gap to its successor is removed and
/// the successor replaced by the intersection of its two neighbours.
pub fn prune_arrival_curve(curve: &mut Curve, n: usize) {
    let n = n + 1; // compensate for the initial origin segment
    while curve.len() > n {
        if curve.last().unwrap().x < PRUNE_X_THRESHOLD {
            break;
        }
        curve.pop();
    }
    while curve.len() > n {
        let mut to_remove = 1;
        let mut min_dy = f64::INFINITY;
        for i in 1..curve.len() - 1 {
            let dy = curve[i + 1].y - curve[i].y;
            if dy < min_dy {
                min_dy = dy;
                to_remove = i;
            }
        }
        curve.remove(to_remove);
        curve[to_remove] = intersection(&curve[to_remove], &curve[to_remove - 1]);
    }
}

/// Number of points an arrival curve is pruned down to after fitting.
const ARRIVAL_CURVE_POINTS: usize = 12;

/// Fit an arrival curve to a trace by simulating token buckets over a
/// descending ladder of candidate rates from `max_rate` down to the trace's
/// sustained rate, then taking the concave envelope and pruning it.
pub fn fit_arrival_curve(entries: &[TraceEntry], max_rate: f64) -> Curve {
    let min_rate = min_sustained_rate(entries);
    let mut rates = Vec::new();
    let mut rate = max_rate;
    while rate >= min_rate {
        rates.push(rate);
        rate -= 0.001 * max_rate;
    }
    let bursts = rb_gen(entries, &rates);
    let mut curve = rb_curve_to_arrival_curve(&rates, &bursts);
    prune_arrival_curve(&mut curve, ARRIVAL_CURVE_POINTS);
    curve
}

/// Read a cached arrival curve: one `x,y,slope` line per segment. The implicit
/// origin segment is not stored and is prepended on read. Returns `None` if
/// the file is missing or unreadable.
pub fn read_arrival_curve(path: &Path) -> Option<Curve> {
    let file = File::open(path).ok()?;
    let mut curve = vec![Segment::origin()];
    for line in BufReader::new(file).lines() {
        let line = line.ok()?;
        let mut fields = line.split(',');
        let (Some(x), Some(y), Some(slope)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        match (
            x.trim().parse::<f64>(),
            y.trim().parse::<f64>(),
            slope.trim().parse::<f64>(),
        ) {
            (Ok(x), Ok(y), Ok(slope)) => curve.push(Segment::new(x, y, slope)),
            _ => continue,
        }
    }
    Some(curve)
}

/// Write an arrival curve to the cache file, skipping the origin segment.
/// Values round-trip exactly through the shortest decimal representation.
pub fn write_arrival_curve(curve: &Curve, path: &Path) -> std::io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for p in curve.iter().skip(1) {
        writeln!(file, "{},{},{}", p.x, p.y, p.slope)?;
    }
    Ok(())
}

/// Load a cached arrival curve, fitting from the trace and refreshing the
/// cache on a miss. Fitting a long trace is expensive, so placements reuse
/// the cache across runs.
pub fn cached_arrival_curve(path: &Path, entries: &[TraceEntry], max_rate: f64) -> Curve {
    if let Some(curve) = read_arrival_curve(path) {
        return curve;
    }
    let curve = fit_arrival_curve(entries, max_rate);
    if let Err(err) = write_arrival_curve(&curve, path) {
        tracing::warn!(path = %path.display(), error = %err, "failed to cache arrival curve");
    }
    curve
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_arrival(initial_y: f64, xs: &[f64], slopes: &[f64]) -> Curve {
        let mut curve = vec![Segment::origin()];
        let mut p = Segment::new(0.0, initial_y, 0.0);
        for (&x, &slope) in xs.iter().zip(slopes) {
            p.y += (x - p.x) * p.slope;
            p.x = x;
            p.slope = slope;
            curve.push(p);
        }
        curve
    }

    fn build_service(xs: &[f64], slopes: &[f64]) -> Curve {
        let mut curve = Curve::new();
        let mut p = Segment::new(0.0, 0.0, 0.0);
        for (&x, &slope) in xs.iter().zip(slopes) {
            p.y += (x - p.x) * p.slope;
            p.x = x;
            p.slope = slope;
            curve.push(p);
        }
        curve
    }

    #[test]
    fn intersection_handles_all_slope_cases() {
        // positive slopes
        let p1 = Segment::new(3.0, 3.0, 1.0);
        let p2 = Segment::new(1.0, 1.0, 0.5);
        assert_eq!(intersection(&p1, &p2), Segment::new(1.0, 1.0, 1.0));
        assert_eq!(intersection(&p2, &p1), Segment::new(1.0, 1.0, 0.5));
        // zero slope
        let p1 = Segment::new(3.0, 3.0, 0.0);
        assert_eq!(intersection(&p1, &p2), Segment::new(5.0, 3.0, 0.0));
        assert_eq!(intersection(&p2, &p1), Segment::new(5.0, 3.0, 0.5));
        // negative slope
        let p1 = Segment::new(3.0, 3.0, -0.5);
        assert_eq!(intersection(&p1, &p2), Segment::new(4.0, 2.5, -0.5));
        assert_eq!(intersection(&p2, &p1), Segment::new(4.0, 2.5, 0.5));
        // equal slopes return p1
        let p1 = Segment::new(2.0, 4.0, 1.0);
        let p2 = Segment::new(1.0, 1.0, 1.0);
        assert_eq!(intersection(&p1, &p2), p1);
        assert_eq!(intersection(&p2, &p1), p2);
        // infinite slope is a vertical line
        let p1 = Segment::origin();
        let p2 = Segment::new(3.0, 7.0, 1.0);
        assert_eq!(
            intersection(&p1, &p2),
            Segment::new(0.0, 4.0, f64::INFINITY)
        );
        assert_eq!(intersection(&p2, &p1), Segment::new(0.0, 4.0, 1.0));
    }

    #[test]
    fn envelope_construction() {
        // distinct rates produce distinct segments
        let curve = rb_curve_to_arrival_curve(&[1.0, 0.25], &[1.0, 4.0]);
        assert_eq!(curve, build_arrival(1.0, &[0.0, 4.0], &[1.0, 0.25]));
        // dominated lines are removed
        let curve =
            rb_curve_to_arrival_curve(&[1.0, 0.75, 0.5, 0.25, 0.125], &[2.0, 1.0, 2.5, 3.0, 4.0]);
        assert_eq!(
            curve,
            build_arrival(1.0, &[0.0, 4.0, 8.0], &[0.75, 0.25, 0.125])
        );
        // a line dominating all predecessors collapses the curve
        let curve =
            rb_curve_to_arrival_curve(&[1.0, 0.75, 0.5, 0.25, 0.125], &[2.0, 3.0, 5.0, 4.5, 1.0]);
        assert_eq!(curve, build_arrival(1.0, &[0.0], &[0.125]));
        // intersections land between the contributing lines
        let curve = rb_curve_to_arrival_curve(&[1.0, 0.5, 0.25], &[2.0, 2.0, 3.0]);
        assert_eq!(curve, build_arrival(2.0, &[0.0, 4.0], &[0.5, 0.25]));
        let curve = rb_curve_to_arrival_curve(&[1.0, 0.5, 0.25], &[1.0, 3.0, 4.0]);
        assert_eq!(curve, build_arrival(1.0, &[0.0, 4.0], &[1.0, 0.25]));
    }

    #[test]
    fn prune_keeps_small_curves_intact() {
        let mut curve = build_arrival(1.0, &[0.0, 1.0, 2.0, 3.0, 4.0], &[6.0, 5.0, 4.0, 3.0, 2.0]);
        prune_arrival_curve(&mut curve, 5);
        assert_eq!(
            curve,
            build_arrival(1.0, &[0.0, 1.0, 2.0, 3.0, 4.0], &[6.0, 5.0, 4.0, 3.0, 2.0])
        );
    }

    #[test]
    fn prune_drops_high_x_segments_first() {
        let mut curve = build_arrival(
            1.0,
            &[0.0, 1.0, 2.0, 3.0, 100.0, 200.0],
            &[6.0, 5.0, 4.0, 3.0, 2.0, 1.0],
        );
        prune_arrival_curve(&mut curve, 4);
        assert_eq!(
            curve,
            build_arrival(1.0, &[0.0, 1.0, 2.0, 3.0], &[6.0, 5.0, 4.0, 3.0])
        );
    }

    #[test]
    fn prune_merges_smallest_y_gap() {
        let mut curve = build_arrival(
            1.0,
            &[0.0, 1.0, 2.0, 3.0, 4.0, 6.0],
            &[6.0, 5.0, 4.0, 3.0, 2.0, 1.0],
        );
        prune_arrival_curve(&mut curve, 5);
        assert_eq!(
            curve,
            build_arrival(1.0, &[0.0, 1.0, 2.0, 3.5, 6.0], &[6.0, 5.0, 4.0, 2.0, 1.0])
        );

        let mut curve = build_arrival(
            1.0,
            &[0.0, 1.0, 2.0, 3.0, 3.5, 4.0, 6.0],
            &[6.0, 5.0, 4.0, 3.5, 2.5, 2.0, 1.0],
        );
        prune_arrival_curve(&mut curve, 5);
        assert_eq!(
            curve,
            build_arrival(1.0, &[0.0, 1.0, 2.0, 3.5, 6.0], &[6.0, 5.0, 4.0, 2.0, 1.0])
        );
    }

    #[test]
    fn prune_to_single_point() {
        let mut curve = build_arrival(1.0, &[0.0, 1.0, 2.0, 3.0, 4.0], &[6.0, 5.0, 4.0, 3.0, 2.0]);
        prune_arrival_curve(&mut curve, 1);
        assert_eq!(curve, build_arrival(11.0, &[0.0], &[2.0]));
    }

    #[test]
    fn vertex_walk_latency() {
        // single arrival point against a delayed service
        let arrival = build_arrival(1.0, &[0.0], &[0.5]);
        let service = build_service(&[0.0, 2.0], &[0.0, 1.0]);
        assert_eq!(curve_latency(&arrival, &service), 3.0);

        // aligned y values
        let arrival = build_arrival(1.0, &[0.0, 1.0, 3.0], &[1.0, 0.5, 0.25]);
        let service = build_service(&[0.0, 1.0, 2.0, 4.0, 8.0], &[0.0, 1.0, 0.5, 0.25, 0.1]);
        assert_eq!(curve_latency(&arrival, &service), 5.0);

        // unaligned y values
        let arrival = build_arrival(1.0, &[0.0, 2.0, 6.0], &[1.0, 0.5, 0.25]);
        let service = build_service(&[0.0, 1.0, 9.0, 13.0], &[0.0, 0.25, 0.5, 1.0]);
        assert_eq!(curve_latency(&arrival, &service), 9.0);

        // mixed alignment at several burst heights
        let xs = [0.0, 1.0, 5.0, 6.6, 10.6, 18.6, 22.6];
        let slopes = [1.0, 0.75, 0.625, 0.5, 0.325, 0.25, 0.125];
        let sxs = [0.0, 1.0, 9.0, 13.0, 21.0, 23.0, 24.6, 28.6];
        let sslopes = [0.0, 0.125, 0.25, 0.375, 0.5, 0.625, 0.75, 1.0];
        let service = build_service(&sxs, &sslopes);
        assert_eq!(
            curve_latency(&build_arrival(1.0, &xs, &slopes), &service),
            16.4
        );
        assert_eq!(
            curve_latency(&build_arrival(3.0, &xs, &slopes), &service),
            19.6
        );
        assert_eq!(
            curve_latency(&build_arrival(6.0, &xs, &slopes), &service),
            23.6
        );

        // a service curve that overtakes the arrival clamps at zero gap
        let arrival = build_arrival(0.0, &[0.0, 1.0, 5.0], &[1.0, 0.5, 0.25]);
        let service = build_service(&[0.0, 1.0, 5.0, 11.0], &[0.0, 1.0, 0.0, 0.5]);
        assert_eq!(curve_latency(&arrival, &service), 2.0);
    }

    #[test]
    fn operators_propagate_overcommitment() {
        let a = TokenBucket::new(2.0, 1.0);
        let s = RateLatency::constant(1.0);
        let left = leftover(&a, &s);
        assert!(left.delay.is_infinite());
        assert!(latency_bound(&TokenBucket::new(0.0, 0.5), &left).is_infinite());
        assert!(latency_bound(&a, &s).is_infinite());
    }

    #[test]
    fn simple_operator_arithmetic() {
        let a = TokenBucket::new(0.25, 0.5);
        let b = TokenBucket::new(0.125, 1.0);
        assert_eq!(aggregate(&a, &b), TokenBucket::new(0.375, 1.5));

        let s = RateLatency { rate: 1.0, delay: 2.0 };
        let t = RateLatency { rate: 0.5, delay: 1.0 };
        assert_eq!(convolve(&s, &t), RateLatency { rate: 0.5, delay: 3.0 });

        assert_eq!(output(&a, &s), TokenBucket::new(0.25, 1.0));

        let left = leftover(&a, &RateLatency::constant(1.0));
        assert_eq!(left.rate, 0.75);
        assert!((left.delay - 0.5 / 0.75).abs() < 1e-12);

        assert_eq!(latency_bound(&a, &RateLatency::constant(1.0)), 0.5);
    }

    #[test]
    fn trace_fitting_matches_hand_computed_bursts() {
        // testTrace analogue: interarrival gaps and work chosen so the
        // virtual buckets peak at easily checked fills
        let entries = [
            TraceEntry { arrival_time: 1.0, work: 3.0 },
            TraceEntry { arrival_time: 2.0, work: 4.0 },
            TraceEntry { arrival_time: 3.0, work: 3.0 },
            TraceEntry { arrival_time: 11.0, work: 2.0 },
        ];
        let bursts = rb_gen(&entries, &[1.0, 0.5, 0.25]);
        assert_eq!(bursts, vec![8.0, 9.0, 9.5]);
        let total: f64 = entries.iter().map(|e| e.work).sum();
        assert_eq!(min_sustained_rate(&entries), total / 10.0);
    }

    #[test]
    fn curve_cache_round_trip() {
        let curve = build_arrival(
            0.5,
            &[0.0, 1.0, 3.0, 7.5],
            &[1.0, 1.0 / 3.0, 0.1234567890123456, 0.0625],
        );
        let path = std::env::temp_dir().join(format!("slogate-curve-{}.txt", std::process::id()));
        write_arrival_curve(&curve, &path).unwrap();
        let read = read_arrival_curve(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(read, curve);
    }

    #[test]
    fn missing_cache_reads_as_none() {
        assert!(read_arrival_curve(Path::new("/nonexistent/curve.txt")).is_none());
    }

    #[test]
    fn cache_miss_fits_and_refreshes() {
        let entries = [
            TraceEntry { arrival_time: 1.0, work: 2.0 },
            TraceEntry { arrival_time: 2.0, work: 2.0 },
            TraceEntry { arrival_time: 11.0, work: 2.0 },
        ];
        let path = std::env::temp_dir().join(format!("slogate-fit-{}.txt", std::process::id()));
        std::fs::remove_file(&path).ok();
        let fitted = cached_arrival_curve(&path, &entries, 2.0);
        assert!(fitted.len() > 1);
        // second call hits the cache and reproduces the fit
        let cached = cached_arrival_curve(&path, &[], 2.0);
        std::fs::remove_file(&path).ok();
        assert_eq!(cached, fitted);
    }
}
