/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Serializable problem instances, for replaying searches and solver
//! queries outside the program that produced them.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::action::{Assign, ContainerSpec, SolverOptions};
use crate::cluster::{AlignedCluster, ClusterError, RotationalCluster, SliceList, SuperCluster};
use crate::table::TableProgram;
use crate::{FieldSlice, SlicingOptions};

/// A slicing problem: the program, one super-cluster and the search
/// options.
///
/// The serialized form of this structure is not stable: it is intended to be
/// deserialized with the exact same version of phvslice as the one that it
/// was created with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializableProblem {
    program: TableProgram,
    /// Rotational clusters, as their aligned clusters' slices.
    clusters: Vec<Vec<Vec<FieldSlice>>>,
    lists: Vec<Vec<FieldSlice>>,
    options: SlicingOptions,
}

impl SerializableProblem {
    pub fn new(program: TableProgram, sc: &SuperCluster, options: SlicingOptions) -> Self {
        Self {
            program,
            clusters: sc
                .clusters()
                .iter()
                .map(|rot| {
                    rot.aligned_clusters()
                        .iter()
                        .map(|aligned| aligned.slices().to_vec())
                        .collect()
                })
                .collect(),
            lists: sc.lists().iter().map(|l| l.slices().to_vec()).collect(),
            options,
        }
    }

    pub fn program(&self) -> &TableProgram {
        &self.program
    }

    pub fn options(&self) -> &SlicingOptions {
        &self.options
    }

    /// Rebuild the super-cluster, checking its structure.
    pub fn super_cluster(&self) -> Result<SuperCluster, ClusterError> {
        let clusters = self
            .clusters
            .iter()
            .map(|rot| {
                RotationalCluster::new(
                    rot.iter()
                        .map(|aligned| AlignedCluster::new(aligned.iter().copied())),
                )
            })
            .collect();
        let lists = self
            .lists
            .iter()
            .map(|l| SliceList::new(l.iter().copied()))
            .collect();
        SuperCluster::new(clusters, lists)
    }
}

/// A single solver query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializableAction {
    pub spec: ContainerSpec,
    pub assigns: Vec<Assign>,
    pub options: SolverOptions,
}

/// Either kind of problem, as read by the command-line tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Problem {
    Slicing(SerializableProblem),
    Action(SerializableAction),
}
