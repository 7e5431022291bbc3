//! Route optimization: k-means clustering of shipments across vehicles, then a
//! nearest-neighbour visiting order inside each cluster.
//!
//! Pure and deterministic: the k-means seed is fixed, so identical inputs always
//! produce identical plans.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Coordinates, Shipment, Vehicle};
use crate::error::{DeliveryError, DeliveryResult};

pub const AVERAGE_SPEED_KMH: f64 = 30.0;
pub const MINUTES_PER_STOP: f64 = 5.0;

const KMEANS_SEED: u64 = 42;
const KMEANS_RESTARTS: usize = 10;
const KMEANS_MAX_ITERATIONS: usize = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    pub vehicle: Vehicle,
    /// Shipments in visiting order.
    pub shipments: Vec<Shipment>,
    pub total_distance_km: f64,
    pub estimated_duration_minutes: i32,
}

/// Partitions geocoded shipments across `vehicles` and orders each partition.
///
/// Returns one plan per non-empty cluster; cluster `i` is driven by `vehicles[i]`.
pub fn optimize(shipments: &[Shipment], vehicles: &[Vehicle]) -> DeliveryResult<Vec<RoutePlan>> {
    if vehicles.is_empty() {
        return Err(DeliveryError::validation("At least one vehicle is required"));
    }

    let points = shipments
        .iter()
        .map(|shipment| {
            shipment
                .coordinates
                .filter(|_| shipment.is_geocoded())
                .ok_or_else(|| {
                    DeliveryError::validation(format!("Shipment {} is not geocoded", shipment.id))
                })
        })
        .collect::<DeliveryResult<Vec<_>>>()?;

    if points.is_empty() {
        return Ok(Vec::new());
    }

    let clusters = cluster(&points, vehicles.len());

    let plans = clusters
        .into_iter()
        .zip(vehicles)
        .filter(|(members, _)| !members.is_empty())
        .map(|(members, vehicle)| {
            let ordered = nearest_neighbor_order(&members, &points);
            let total_distance_km = round_km(path_distance(&ordered, &points));
            let stops: Vec<Shipment> = ordered.iter().map(|&i| shipments[i].clone()).collect();

            RoutePlan {
                vehicle: vehicle.clone(),
                estimated_duration_minutes: estimate_duration_minutes(total_distance_km, stops.len()),
                total_distance_km,
                shipments: stops,
            }
        })
        .collect();

    Ok(plans)
}

/// Driving time at the average urban speed plus a fixed service time per stop.
pub fn estimate_duration_minutes(total_distance_km: f64, stop_count: usize) -> i32 {
    let driving = total_distance_km / AVERAGE_SPEED_KMH * 60.0;
    let stopped = stop_count as f64 * MINUTES_PER_STOP;
    (driving + stopped) as i32
}

fn round_km(km: f64) -> f64 {
    (km * 100.0).round() / 100.0
}

fn path_distance(order: &[usize], points: &[Coordinates]) -> f64 {
    order
        .windows(2)
        .map(|pair| points[pair[0]].distance_to(&points[pair[1]]))
        .sum()
}

/// Groups point indices into exactly `k` clusters (some possibly empty when
/// there are fewer points than clusters).
fn cluster(points: &[Coordinates], k: usize) -> Vec<Vec<usize>> {
    if points.len() <= k {
        let mut clusters: Vec<Vec<usize>> = (0..points.len()).map(|i| vec![i]).collect();
        clusters.resize_with(k, Vec::new);
        return clusters;
    }

    let labels = kmeans(points, k);
    let mut clusters = vec![Vec::new(); k];
    for (index, label) in labels.into_iter().enumerate() {
        clusters[label].push(index);
    }
    clusters
}

fn nearest_neighbor_order(members: &[usize], points: &[Coordinates]) -> Vec<usize> {
    let Some((&first, rest)) = members.split_first() else {
        return Vec::new();
    };

    let mut ordered = Vec::with_capacity(members.len());
    ordered.push(first);
    let mut remaining = rest.to_vec();

    while !remaining.is_empty() {
        let current = &points[ordered[ordered.len() - 1]];
        let mut nearest = 0;
        let mut nearest_distance = f64::INFINITY;

        for (position, &candidate) in remaining.iter().enumerate() {
            let distance = current.distance_to(&points[candidate]);
            if distance < nearest_distance {
                nearest_distance = distance;
                nearest = position;
            }
        }

        ordered.push(remaining.remove(nearest));
    }

    ordered
}

type Point = [f64; 2];

fn squared_distance(a: &Point, b: &Point) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

/// Lloyd's k-means over the (lat, lon) plane with k-means++ seeding, keeping the
/// lowest-inertia labelling across restarts. Requires `points.len() > k`.
fn kmeans(coordinates: &[Coordinates], k: usize) -> Vec<usize> {
    let points: Vec<Point> = coordinates
        .iter()
        .map(|c| [c.latitude(), c.longitude()])
        .collect();
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);

    let mut best: Option<(f64, Vec<usize>)> = None;
    for _ in 0..KMEANS_RESTARTS {
        let centroids = kmeans_plus_plus(&points, k, &mut rng);
        let (labels, inertia) = lloyd(&points, centroids);

        if best.as_ref().map_or(true, |(best_inertia, _)| inertia < *best_inertia) {
            best = Some((inertia, labels));
        }
    }

    best.map(|(_, labels)| labels).unwrap_or_default()
}

fn kmeans_plus_plus(points: &[Point], k: usize, rng: &mut StdRng) -> Vec<Point> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())]);

    while centroids.len() < k {
        let weights: Vec<f64> = points
            .iter()
            .map(|point| {
                centroids
                    .iter()
                    .map(|centroid| squared_distance(point, centroid))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();

        // All remaining points coincide with a centroid: fall back to uniform.
        let next = match WeightedIndex::new(&weights) {
            Ok(distribution) => distribution.sample(rng),
            Err(_) => rng.gen_range(0..points.len()),
        };
        centroids.push(points[next]);
    }

    centroids
}

fn lloyd(points: &[Point], mut centroids: Vec<Point>) -> (Vec<usize>, f64) {
    let k = centroids.len();
    let mut labels: Vec<usize> = Vec::new();

    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut next = assign(points, &centroids);
        fill_empty_clusters(points, &centroids, &mut next, k);

        let converged = next == labels;
        labels = next;
        if converged {
            break;
        }

        centroids = recompute_centroids(points, &labels, &centroids);
    }

    let inertia = points
        .iter()
        .zip(&labels)
        .map(|(point, &label)| squared_distance(point, &centroids[label]))
        .sum();

    (labels, inertia)
}

fn assign(points: &[Point], centroids: &[Point]) -> Vec<usize> {
    points
        .iter()
        .map(|point| {
            let mut best = 0;
            let mut best_distance = f64::INFINITY;
            for (label, centroid) in centroids.iter().enumerate() {
                let distance = squared_distance(point, centroid);
                if distance < best_distance {
                    best_distance = distance;
                    best = label;
                }
            }
            best
        })
        .collect()
}

/// Moves the point farthest from its centroid (taken from a cluster with more
/// than one member) into each empty cluster, so every cluster ends non-empty.
fn fill_empty_clusters(points: &[Point], centroids: &[Point], labels: &mut [usize], k: usize) {
    let mut sizes = vec![0usize; k];
    for &label in labels.iter() {
        sizes[label] += 1;
    }

    for empty in 0..k {
        if sizes[empty] > 0 {
            continue;
        }

        let donor = labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| sizes[label] > 1)
            .map(|(index, &label)| (index, squared_distance(&points[index], &centroids[label])))
            .fold(None, |farthest: Option<(usize, f64)>, candidate| match farthest {
                Some(current) if current.1 >= candidate.1 => Some(current),
                _ => Some(candidate),
            });

        if let Some((index, _)) = donor {
            sizes[labels[index]] -= 1;
            labels[index] = empty;
            sizes[empty] = 1;
        }
    }
}

fn recompute_centroids(points: &[Point], labels: &[usize], previous: &[Point]) -> Vec<Point> {
    let mut sums = vec![[0.0, 0.0]; previous.len()];
    let mut counts = vec![0usize; previous.len()];

    for (point, &label) in points.iter().zip(labels) {
        sums[label][0] += point[0];
        sums[label][1] += point[1];
        counts[label] += 1;
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((sum, count), prior)| {
            if count == 0 {
                *prior
            } else {
                [sum[0] / count as f64, sum[1] / count as f64]
            }
        })
        .collect()
}
