//! Hierarchical point clustering over Web Mercator.
//!
//! Points are projected to the unit square and greedily merged per zoom
//! level, from `max_zoom` down to `min_zoom`. Each level keeps its own KD
//! index so viewport queries only touch one level.
//!
//! Cluster ids encode where the cluster was formed:
//! `(origin_index << 5) + (origin_zoom) + point_count`, so children and
//! leaves can be found again without a separate lookup table.

use serde::Serialize;
use std::f64::consts::PI;
use thiserror::Error;

use super::kdindex::KdIndex;
use super::marker::Marker;

const UNVISITED: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterOptions {
  pub min_zoom: u8,
  pub max_zoom: u8,
  /// Cluster radius in pixels
  pub radius: f64,
  /// Tile extent the radius is relative to
  pub extent: f64,
  pub min_points: usize,
  pub node_size: usize,
}

impl Default for ClusterOptions {
  fn default() -> Self {
    Self {
      min_zoom: 0,
      max_zoom: 16,
      radius: 60.0,
      extent: 512.0,
      min_points: 2,
      node_size: KdIndex::DEFAULT_NODE_SIZE,
    }
  }
}

/// Viewport in degrees: west, south, east, north.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
pub struct BBox {
  pub west: f64,
  pub south: f64,
  pub east: f64,
  pub north: f64,
}

impl BBox {
  pub const WORLD: BBox = BBox {
    west: -180.0,
    south: -90.0,
    east: 180.0,
    north: 90.0,
  };

  pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
    Self {
      west,
      south,
      east,
      north,
    }
  }
}

/// One entry of a cluster query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClusterFeature {
  #[serde(rename_all = "camelCase")]
  Cluster {
    cluster_id: u64,
    lat: f64,
    lng: f64,
    point_count: usize,
  },
  Point(Marker),
}

impl ClusterFeature {
  pub fn point_count(&self) -> usize {
    match self {
      ClusterFeature::Cluster { point_count, .. } => *point_count,
      ClusterFeature::Point(_) => 1,
    }
  }

  pub fn cluster_id(&self) -> Option<u64> {
    match self {
      ClusterFeature::Cluster { cluster_id, .. } => Some(*cluster_id),
      ClusterFeature::Point(_) => None,
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
  #[error("No cluster with the specified id: {0}")]
  NoCluster(u64),
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
  /// Index into the indexed markers
  Point(usize),
  Cluster { id: u64, count: usize },
}

#[derive(Debug, Clone, Copy)]
struct Node {
  x: f64,
  y: f64,
  /// Zoom at which this node was last visited while clustering
  zoom: u8,
  parent: Option<u64>,
  kind: NodeKind,
}

impl Node {
  fn num_points(&self) -> usize {
    match self.kind {
      NodeKind::Point(_) => 1,
      NodeKind::Cluster { count, .. } => count,
    }
  }

  fn fresh(&self) -> Self {
    Self {
      zoom: UNVISITED,
      parent: None,
      ..*self
    }
  }
}

#[derive(Debug)]
struct Level {
  nodes: Vec<Node>,
  index: KdIndex,
}

impl Level {
  fn new(nodes: Vec<Node>, node_size: usize) -> Self {
    let index = KdIndex::build(nodes.iter().map(|n| (n.x, n.y)), node_size);
    Self { nodes, index }
  }
}

/// Clustering hierarchy over a fixed marker set.
#[derive(Debug)]
pub struct ClusterIndex {
  options: ClusterOptions,
  points: Vec<Marker>,
  /// One level per zoom in `0..=max_zoom + 1`; below `min_zoom` is None
  levels: Vec<Option<Level>>,
}

impl ClusterIndex {
  pub fn build(points: Vec<Marker>, options: ClusterOptions) -> Self {
    let max_zoom = options.max_zoom.min(30);
    let min_zoom = options.min_zoom.min(max_zoom);
    let options = ClusterOptions {
      min_zoom,
      max_zoom,
      ..options
    };

    let leaves: Vec<Node> = points
      .iter()
      .enumerate()
      .map(|(i, p)| Node {
        x: lng_x(p.lng),
        y: lat_y(p.lat),
        zoom: UNVISITED,
        parent: None,
        kind: NodeKind::Point(i),
      })
      .collect();

    let mut levels: Vec<Option<Level>> = (0..=usize::from(max_zoom) + 1).map(|_| None).collect();
    levels[usize::from(max_zoom) + 1] = Some(Level::new(leaves, options.node_size));

    let mut index = Self {
      options,
      points,
      levels,
    };

    for zoom in (min_zoom..=max_zoom).rev() {
      let next = index.cluster_level(zoom);
      index.levels[usize::from(zoom)] = Some(Level::new(next, options.node_size));
    }

    index
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Merge the nodes of level `zoom + 1` into the nodes of level `zoom`.
  fn cluster_level(&mut self, zoom: u8) -> Vec<Node> {
    let ClusterOptions {
      radius,
      extent,
      min_points,
      ..
    } = self.options;
    let point_total = self.points.len() as u64;
    let r = radius / (extent * 2f64.powi(i32::from(zoom)));

    let Some(level) = self.levels[usize::from(zoom) + 1].as_mut() else {
      return Vec::new();
    };
    let Level { nodes, index } = level;
    let mut next = Vec::new();

    for i in 0..nodes.len() {
      if nodes[i].zoom <= zoom {
        continue;
      }
      nodes[i].zoom = zoom;

      let (x, y) = (nodes[i].x, nodes[i].y);
      let neighbors = index.within(x, y, r);

      let origin_points = nodes[i].num_points();
      let num_points = origin_points
        + neighbors
          .iter()
          .filter(|&&n| nodes[n].zoom > zoom)
          .map(|&n| nodes[n].num_points())
          .sum::<usize>();

      if num_points > origin_points && num_points >= min_points {
        let id = ((i as u64) << 5) + u64::from(zoom) + 1 + point_total;
        let mut wx = x * origin_points as f64;
        let mut wy = y * origin_points as f64;

        for &n in &neighbors {
          if nodes[n].zoom <= zoom {
            continue;
          }
          nodes[n].zoom = zoom;
          let weight = nodes[n].num_points() as f64;
          wx += nodes[n].x * weight;
          wy += nodes[n].y * weight;
          nodes[n].parent = Some(id);
        }
        nodes[i].parent = Some(id);

        next.push(Node {
          x: wx / num_points as f64,
          y: wy / num_points as f64,
          zoom: UNVISITED,
          parent: None,
          kind: NodeKind::Cluster {
            id,
            count: num_points,
          },
        });
      } else {
        next.push(nodes[i].fresh());

        if num_points > 1 {
          for &n in &neighbors {
            if nodes[n].zoom <= zoom {
              continue;
            }
            nodes[n].zoom = zoom;
            next.push(nodes[n].fresh());
          }
        }
      }
    }

    next
  }

  fn limit_zoom(&self, zoom: f64) -> usize {
    let z = zoom.floor();
    let lo = f64::from(self.options.min_zoom);
    let hi = f64::from(self.options.max_zoom) + 1.0;
    if z.is_nan() {
      return usize::from(self.options.min_zoom);
    }
    z.clamp(lo, hi) as usize
  }

  /// Clusters and points visible in `bbox` at `zoom`.
  pub fn get_clusters(&self, bbox: BBox, zoom: f64) -> Vec<ClusterFeature> {
    let mut min_lng = ((bbox.west + 180.0) % 360.0 + 360.0) % 360.0 - 180.0;
    let min_lat = bbox.south.clamp(-90.0, 90.0);
    let mut max_lng = if bbox.east == 180.0 {
      180.0
    } else {
      ((bbox.east + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
    };
    let max_lat = bbox.north.clamp(-90.0, 90.0);

    if bbox.east - bbox.west >= 360.0 {
      min_lng = -180.0;
      max_lng = 180.0;
    } else if min_lng > max_lng {
      // Viewport crosses the antimeridian.
      let mut features = self.get_clusters(BBox::new(min_lng, min_lat, 180.0, max_lat), zoom);
      features.extend(self.get_clusters(BBox::new(-180.0, min_lat, max_lng, max_lat), zoom));
      return features;
    }

    let Some(level) = self.levels[self.limit_zoom(zoom)].as_ref() else {
      return Vec::new();
    };

    level
      .index
      .range(lng_x(min_lng), lat_y(max_lat), lng_x(max_lng), lat_y(min_lat))
      .into_iter()
      .map(|id| self.feature(&level.nodes[id]))
      .collect()
  }

  fn feature(&self, node: &Node) -> ClusterFeature {
    match node.kind {
      NodeKind::Point(i) => ClusterFeature::Point(self.points[i].clone()),
      NodeKind::Cluster { id, count } => ClusterFeature::Cluster {
        cluster_id: id,
        lat: y_lat(node.y),
        lng: x_lng(node.x),
        point_count: count,
      },
    }
  }

  fn origin(&self, cluster_id: u64) -> Result<(usize, usize), ClusterError> {
    let rel = cluster_id
      .checked_sub(self.points.len() as u64)
      .ok_or(ClusterError::NoCluster(cluster_id))?;
    Ok(((rel >> 5) as usize, (rel % 32) as usize))
  }

  fn child_nodes(&self, cluster_id: u64) -> Result<Vec<Node>, ClusterError> {
    let (origin_id, origin_zoom) = self.origin(cluster_id)?;
    let level = self
      .levels
      .get(origin_zoom)
      .and_then(Option::as_ref)
      .ok_or(ClusterError::NoCluster(cluster_id))?;
    let origin = level
      .nodes
      .get(origin_id)
      .ok_or(ClusterError::NoCluster(cluster_id))?;

    let r = self.options.radius
      / (self.options.extent * 2f64.powi(origin_zoom as i32 - 1));
    let children: Vec<Node> = level
      .index
      .within(origin.x, origin.y, r)
      .into_iter()
      .map(|i| level.nodes[i])
      .filter(|n| n.parent == Some(cluster_id))
      .collect();

    if children.is_empty() {
      return Err(ClusterError::NoCluster(cluster_id));
    }
    Ok(children)
  }

  /// Zoom at which a cluster breaks into more than one child.
  pub fn get_cluster_expansion_zoom(&self, cluster_id: u64) -> Result<u8, ClusterError> {
    let (_, origin_zoom) = self.origin(cluster_id)?;
    let mut expansion_zoom = origin_zoom.saturating_sub(1);
    let mut id = cluster_id;

    while expansion_zoom <= usize::from(self.options.max_zoom) {
      let children = self.child_nodes(id)?;
      expansion_zoom += 1;
      if children.len() != 1 {
        break;
      }
      match children[0].kind {
        NodeKind::Cluster { id: child, .. } => id = child,
        NodeKind::Point(_) => break,
      }
    }

    Ok(expansion_zoom.min(usize::from(u8::MAX)) as u8)
  }

  /// Original points under a cluster, paginated.
  pub fn get_leaves(
    &self,
    cluster_id: u64,
    limit: usize,
    offset: usize,
  ) -> Result<Vec<Marker>, ClusterError> {
    let mut leaves = Vec::new();
    if limit > 0 {
      self.append_leaves(&mut leaves, cluster_id, limit, offset, 0)?;
    }
    Ok(leaves)
  }

  fn append_leaves(
    &self,
    result: &mut Vec<Marker>,
    cluster_id: u64,
    limit: usize,
    offset: usize,
    mut skipped: usize,
  ) -> Result<usize, ClusterError> {
    for child in self.child_nodes(cluster_id)? {
      match child.kind {
        NodeKind::Cluster { id, count } => {
          if skipped + count <= offset {
            skipped += count;
          } else {
            skipped = self.append_leaves(result, id, limit, offset, skipped)?;
          }
        }
        NodeKind::Point(i) => {
          if skipped < offset {
            skipped += 1;
          } else {
            result.push(self.points[i].clone());
          }
        }
      }
      if result.len() == limit {
        break;
      }
    }
    Ok(skipped)
  }
}

fn lng_x(lng: f64) -> f64 {
  lng / 360.0 + 0.5
}

fn lat_y(lat: f64) -> f64 {
  let sin = (lat * PI / 180.0).sin();
  let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;
  y.clamp(0.0, 1.0)
}

fn x_lng(x: f64) -> f64 {
  (x - 0.5) * 360.0
}

fn y_lat(y: f64) -> f64 {
  let y2 = (180.0 - y * 360.0) * PI / 180.0;
  360.0 * y2.exp().atan() / PI - 90.0
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeSet;

  fn marker(id: String, lat: f64, lng: f64) -> Marker {
    Marker {
      id,
      lat,
      lng,
      stop_id: None,
      address: None,
      neighborhood: None,
      area: None,
      status: None,
      model: None,
      partner_client: None,
      has_digital: false,
      has_static: false,
      has_abrigo_amigo: false,
    }
  }

  /// Two tight groups of five: around Sao Paulo and around Rio.
  fn two_cities() -> Vec<Marker> {
    let mut points = Vec::new();
    for i in 0..5 {
      let d = f64::from(i) * 0.001;
      points.push(marker(format!("SP{i}"), -23.55 + d, -46.63 + d));
      points.push(marker(format!("RJ{i}"), -22.90 + d, -43.20 - d));
    }
    points
  }

  fn world(index: &ClusterIndex, zoom: f64) -> Vec<ClusterFeature> {
    index.get_clusters(BBox::WORLD, zoom)
  }

  #[test]
  fn test_projection_round_trips() {
    for (lat, lng) in [(-23.55, -46.63), (0.0, 0.0), (60.0, 179.0)] {
      assert!((y_lat(lat_y(lat)) - lat).abs() < 1e-9);
      assert!((x_lng(lng_x(lng)) - lng).abs() < 1e-9);
    }
  }

  #[test]
  fn test_cluster_counts_per_zoom() {
    let index = ClusterIndex::build(two_cities(), ClusterOptions::default());

    let z0 = world(&index, 0.0);
    assert_eq!(z0.len(), 1);
    assert_eq!(z0[0].point_count(), 10);

    let z10 = world(&index, 10.0);
    assert_eq!(z10.len(), 2);
    assert!(z10.iter().all(|f| f.point_count() == 5));

    let leaves = world(&index, 17.0);
    assert_eq!(leaves.len(), 10);
    assert!(leaves.iter().all(|f| matches!(f, ClusterFeature::Point(_))));
  }

  #[test]
  fn test_viewport_limits_results() {
    let index = ClusterIndex::build(two_cities(), ClusterOptions::default());
    let around_sp = BBox::new(-47.0, -24.0, -46.0, -23.0);

    let features = index.get_clusters(around_sp, 17.0);

    assert_eq!(features.len(), 5);
    assert!(features
      .iter()
      .all(|f| matches!(f, ClusterFeature::Point(m) if m.id.starts_with("SP"))));
  }

  #[test]
  fn test_antimeridian_viewport_wraps() {
    let points = vec![
      marker("E".into(), 10.0, 179.5),
      marker("W".into(), 10.0, -179.5),
      marker("X".into(), 10.0, 0.0),
    ];
    let index = ClusterIndex::build(points, ClusterOptions::default());

    let features = index.get_clusters(BBox::new(179.0, 0.0, -179.0, 20.0), 17.0);

    let ids: BTreeSet<_> = features
      .iter()
      .filter_map(|f| match f {
        ClusterFeature::Point(m) => Some(m.id.as_str()),
        _ => None,
      })
      .collect();
    assert_eq!(ids, BTreeSet::from(["E", "W"]));
  }

  #[test]
  fn test_expansion_zoom_splits_cluster() {
    let index = ClusterIndex::build(two_cities(), ClusterOptions::default());
    let id = world(&index, 0.0)[0].cluster_id().unwrap();

    let zoom = index.get_cluster_expansion_zoom(id).unwrap();

    assert!(zoom >= 1);
    assert!(world(&index, f64::from(zoom)).len() > 1);
    assert_eq!(world(&index, f64::from(zoom) - 1.0).len(), 1);
  }

  #[test]
  fn test_leaves_are_paginated() {
    let index = ClusterIndex::build(two_cities(), ClusterOptions::default());
    let id = world(&index, 0.0)[0].cluster_id().unwrap();

    assert_eq!(index.get_leaves(id, 4, 0).unwrap().len(), 4);
    assert_eq!(index.get_leaves(id, 10, 8).unwrap().len(), 2);

    let all: BTreeSet<_> = index
      .get_leaves(id, usize::MAX, 0)
      .unwrap()
      .into_iter()
      .map(|m| m.id)
      .collect();
    assert_eq!(all.len(), 10);
  }

  #[test]
  fn test_unknown_cluster_id_is_an_error() {
    let index = ClusterIndex::build(two_cities(), ClusterOptions::default());
    assert_eq!(
      index.get_leaves(3, 10, 0),
      Err(ClusterError::NoCluster(3))
    );
    assert!(index.get_cluster_expansion_zoom(999_999).is_err());
  }
}
