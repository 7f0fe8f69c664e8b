//! Router mode codes
//!
//! Every cluster has one router per port lane. Its mode code says where the
//! router takes data from and where it forwards it. Clusters that cooperate
//! on one kernel (a cluster-row group of `used_y_cluster` rows) are chained:
//! activations enter at the first row of the group and travel down, partial
//! sums travel up and leave through the first row.
//!
//! Partial-sum codes are a bit set: bit 0 receives from the row below, bit 1
//! sends to the row above, bit 2 writes to the GLB. Depthwise psum routers
//! always write to the GLB.

use serde::{Deserialize, Serialize};

use crate::hardware::{AcceleratorConfig, Port};
use crate::layer::LayerKind;

/// Position of a cluster inside its cluster-row group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterRole {
    /// Not chained to any neighbour
    Isolated,
    /// First row of a group; activations enter here, partial sums leave here
    SourceEdge,
    PassThrough,
    /// Last row of a group
    SinkEdge,
}

impl RouterRole {
    /// Role of cluster row `cl_y` when groups of `used_y` rows cooperate
    pub fn of(cl_y: usize, used_y: usize, groups: usize) -> Self {
        if used_y <= 1 || cl_y >= groups * used_y {
            return RouterRole::Isolated;
        }
        match cl_y % used_y {
            0 => RouterRole::SourceEdge,
            offset if offset == used_y - 1 => RouterRole::SinkEdge,
            _ => RouterRole::PassThrough,
        }
    }
}

fn iact_code(kind: LayerKind, role: RouterRole) -> u8 {
    match (kind, role) {
        (_, RouterRole::Isolated) => 1,
        (_, RouterRole::SourceEdge) => 9,
        (LayerKind::DepthwiseConv, RouterRole::PassThrough) => 41,
        (LayerKind::DepthwiseConv, RouterRole::SinkEdge) => 33,
        (_, RouterRole::PassThrough) => 25,
        (_, RouterRole::SinkEdge) => 17,
    }
}

fn wght_code(kind: LayerKind, cl_x: usize) -> u8 {
    match kind {
        LayerKind::Dense => 0,
        LayerKind::Conv | LayerKind::DepthwiseConv => u8::from(cl_x != 0),
    }
}

fn psum_code(kind: LayerKind, role: RouterRole, router: usize) -> u8 {
    match kind {
        LayerKind::Dense => {
            if router == 0 {
                4
            } else {
                0
            }
        }
        LayerKind::DepthwiseConv => 4,
        LayerKind::Conv => match role {
            RouterRole::Isolated => 4,
            RouterRole::SourceEdge => 5,
            RouterRole::PassThrough => 3,
            RouterRole::SinkEdge => 2,
        },
    }
}

/// Mode code of every router, indexed by [`Port::lane`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterCodes {
    pub iact: Vec<u8>,
    pub wght: Vec<u8>,
    pub psum: Vec<u8>,
}

impl RouterCodes {
    pub fn build(config: &AcceleratorConfig, kind: LayerKind, used_y: usize, groups: usize) -> Self {
        let mut codes = Self {
            iact: vec![0; Port::Iact.lanes(config)],
            wght: vec![0; Port::Wght.lanes(config)],
            psum: vec![0; Port::Psum.lanes(config)],
        };
        for cl_x in 0..config.cluster_cols {
            for cl_y in 0..config.cluster_rows {
                let role = RouterRole::of(cl_y, used_y, groups);
                for router in 0..config.iact_routers {
                    codes.iact[Port::Iact.lane(config, cl_x, cl_y, router)] = iact_code(kind, role);
                }
                for router in 0..config.wght_routers {
                    codes.wght[Port::Wght.lane(config, cl_x, cl_y, router)] = wght_code(kind, cl_x);
                }
                for router in 0..config.psum_routers {
                    codes.psum[Port::Psum.lane(config, cl_x, cl_y, router)] = psum_code(kind, role, router);
                }
            }
        }
        codes
    }

    pub fn port(&self, port: Port) -> &[u8] {
        match port {
            Port::Iact => &self.iact,
            Port::Wght => &self.wght,
            Port::Psum => &self.psum,
        }
    }

    pub fn get(&self, config: &AcceleratorConfig, port: Port, cl_x: usize, cl_y: usize, router: usize) -> u8 {
        self.port(port)[port.lane(config, cl_x, cl_y, router)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_within_groups() {
        assert_eq!(RouterRole::of(0, 1, 8), RouterRole::Isolated);
        assert_eq!(RouterRole::of(0, 3, 2), RouterRole::SourceEdge);
        assert_eq!(RouterRole::of(1, 3, 2), RouterRole::PassThrough);
        assert_eq!(RouterRole::of(2, 3, 2), RouterRole::SinkEdge);
        assert_eq!(RouterRole::of(3, 3, 2), RouterRole::SourceEdge);
        assert_eq!(RouterRole::of(6, 3, 2), RouterRole::Isolated);
        assert_eq!(RouterRole::of(1, 2, 4), RouterRole::SinkEdge);
    }

    #[test]
    fn test_conv_codes_single_row_groups() {
        let config = AcceleratorConfig::default();
        let codes = RouterCodes::build(&config, LayerKind::Conv, 1, 8);
        assert!(codes.iact.iter().all(|&c| c == 1));
        assert!(codes.psum.iter().all(|&c| c == 4));
        assert_eq!(codes.get(&config, Port::Wght, 0, 5, 2), 0);
        assert_eq!(codes.get(&config, Port::Wght, 1, 5, 2), 1);
    }

    #[test]
    fn test_chained_codes_differ_for_depthwise() {
        let config = AcceleratorConfig::default();
        let conv = RouterCodes::build(&config, LayerKind::Conv, 3, 2);
        let dw = RouterCodes::build(&config, LayerKind::DepthwiseConv, 3, 2);
        let column: Vec<u8> = (0..8).map(|y| conv.get(&config, Port::Iact, 1, y, 0)).collect();
        assert_eq!(column, vec![9, 25, 17, 9, 25, 17, 1, 1]);
        let column: Vec<u8> = (0..8).map(|y| dw.get(&config, Port::Iact, 1, y, 0)).collect();
        assert_eq!(column, vec![9, 41, 33, 9, 41, 33, 1, 1]);
        let psum: Vec<u8> = (0..4).map(|y| conv.get(&config, Port::Psum, 0, y, 3)).collect();
        assert_eq!(psum, vec![5, 3, 2, 5]);
    }

    #[test]
    fn test_depthwise_psum_routers_write_to_glb() {
        let config = AcceleratorConfig::default();
        let dw = RouterCodes::build(&config, LayerKind::DepthwiseConv, 3, 2);
        assert_eq!(dw.psum.len(), Port::Psum.lanes(&config));
        assert!(dw.psum.iter().all(|&c| c == 4));
    }

    #[test]
    fn test_dense_codes() {
        let config = AcceleratorConfig::default();
        let codes = RouterCodes::build(&config, LayerKind::Dense, 8, 1);
        assert_eq!(codes.get(&config, Port::Iact, 0, 0, 1), 9);
        assert_eq!(codes.get(&config, Port::Iact, 0, 7, 1), 17);
        assert_eq!(codes.get(&config, Port::Psum, 1, 3, 0), 4);
        assert_eq!(codes.get(&config, Port::Psum, 1, 3, 1), 0);
        assert!(codes.wght.iter().all(|&c| c == 0));
    }
}
