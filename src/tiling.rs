//! Geometry planning for one layer
//!
//! Maps a layer onto the fixed PE grid. Spatial layers use a row-stationary
//! layout:
//!
//! - PE rows hold kernel rows. When the kernel is taller than a cluster,
//!   `used_y_cluster` consecutive cluster rows form a group and chain.
//! - PE columns hold neighbouring output positions of one output row.
//! - Each refresh assigns `cluster_groups * cluster_cols * pe_cols` output
//!   positions (the slots) in raster order.
//!
//! When a layer does not fit into one pass, it is split into repetitions
//! along three axes: input channel groups, filter groups and spatial windows.
//! Repetition `r` decomposes as `channel + iact_tx * (filter + wght_tx *
//! window)`.
//!
//! Dense layers use PE column 0 only. Input neurons are split across PE rows
//! and output neurons across clusters.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

use crate::error::{MapError, MapResult};
use crate::hardware::{AcceleratorConfig, Port};
use crate::layer::{LayerKind, LayerShape};
use crate::routing::RouterCodes;
use crate::status::NEEDED_REFRESHES_BITS;

/// Dense layers keep at most this many input neurons per PE
const DENSE_IACTS_PER_PE: usize = 12;
/// Dense layers keep at most this many output neurons per PE
const DENSE_PSUMS_PER_PE: usize = 16;

/// Channels held per PE for a given kernel width
pub fn channels_for_kernel_width(kernel_width: usize) -> Option<usize> {
    match kernel_width {
        1 => Some(12),
        3 => Some(4),
        5 => Some(2),
        w if w >= 8 => Some(1),
        _ => None,
    }
}

/// Idle PE columns appended to every output row so rows start on a PE
/// column boundary.
///
/// TODO: the accepted widths (below 8, or between 12 and 16) are the ones
/// validated on the 4x3 PE instance; confirm the breakpoints with the
/// hardware team before enabling other geometries.
pub fn add_up_for(output_width: usize, pe_cols: usize) -> MapResult<usize> {
    let rest = output_width % pe_cols;
    if rest == 0 {
        Ok(0)
    } else if output_width < 8 || (output_width > 12 && output_width < 16) {
        Ok(pe_cols - rest)
    } else {
        Err(MapError::UnsupportedOutputWidth {
            width: output_width,
            pe_cols,
        })
    }
}

/// Active PEs a correct plan must report
pub fn expected_active_pes(config: &AcceleratorConfig, shape: &LayerShape) -> MapResult<usize> {
    match shape.kind {
        LayerKind::Dense => Ok(config.num_clusters() * config.pe_rows),
        LayerKind::Conv | LayerKind::DepthwiseConv => {
            let used_y = shape.kernel_height.div_ceil(config.pe_rows);
            let groups = config.cluster_rows / used_y;
            let out_w = shape.out_width();
            let padded = out_w + add_up_for(out_w, config.pe_cols)?;
            let slots = groups * config.cluster_cols * config.pe_cols;
            Ok(shape.kernel_height * slots * out_w / padded)
        }
    }
}

/// Which PEs contribute to the layer, indexed `[cl_x][cl_y][pe_y][pe_x]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputingMask {
    cluster_cols: usize,
    cluster_rows: usize,
    pe_rows: usize,
    pe_cols: usize,
    active: Vec<bool>,
}

impl ComputingMask {
    pub fn full(config: &AcceleratorConfig) -> Self {
        Self {
            cluster_cols: config.cluster_cols,
            cluster_rows: config.cluster_rows,
            pe_rows: config.pe_rows,
            pe_cols: config.pe_cols,
            active: vec![true; config.total_pes()],
        }
    }

    /// Flat index, which is also the bit position in the status mask
    pub fn index(&self, cl_x: usize, cl_y: usize, pe_y: usize, pe_x: usize) -> usize {
        ((cl_x * self.cluster_rows + cl_y) * self.pe_rows + pe_y) * self.pe_cols + pe_x
    }

    pub fn get(&self, cl_x: usize, cl_y: usize, pe_y: usize, pe_x: usize) -> bool {
        self.active[self.index(cl_x, cl_y, pe_y, pe_x)]
    }

    pub fn set(&mut self, cl_x: usize, cl_y: usize, pe_y: usize, pe_x: usize, active: bool) {
        let idx = self.index(cl_x, cl_y, pe_y, pe_x);
        self.active[idx] = active;
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn cluster_active(&self, cl_x: usize, cl_y: usize) -> bool {
        (0..self.pe_rows).any(|pe_y| self.pe_row_active(cl_x, cl_y, pe_y))
    }

    pub fn pe_row_active(&self, cl_x: usize, cl_y: usize, pe_y: usize) -> bool {
        (0..self.pe_cols).any(|pe_x| self.get(cl_x, cl_y, pe_y, pe_x))
    }

    pub fn pe_col_active(&self, cl_x: usize, cl_y: usize, pe_x: usize) -> bool {
        (0..self.pe_rows).any(|pe_y| self.get(cl_x, cl_y, pe_y, pe_x))
    }

    /// Mask bits in index order
    pub fn bits(&self) -> &[bool] {
        &self.active
    }
}

/// Half-open window of refresh cycles handled by one repetition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRange {
    pub count: usize,
    pub start: usize,
    pub end: usize,
}

/// One psum lane during one refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsumSlot {
    pub lane: usize,
    pub cl_x: usize,
    /// First cluster row of the group (dense: the cluster row itself)
    pub cl_y: usize,
    pub pe_x: usize,
    /// Spatial refresh (dense: output window)
    pub refresh: usize,
    pub first_filter: usize,
    /// Output (y, x), or `None` for idle positions past the map
    pub position: Option<(usize, usize)>,
}

/// Position of a repetition along the three tiling axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepetitionIndex {
    pub channel_group: usize,
    pub filter_group: usize,
    pub window: usize,
}

/// Complete tiling of one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingPlan {
    pub shape: LayerShape,

    /// Input channels (dense: input neurons) held per PE
    pub used_channels: usize,
    /// Input channels (dense: neurons) consumed by one channel group
    pub channels_per_pass: usize,
    /// Values in one transmitted activation line
    pub line_occupancy: usize,
    pub used_iact_per_pe: usize,
    pub used_wght_per_pe: usize,
    pub used_psum_per_pe: usize,
    pub used_iact_addr_per_pe: usize,
    pub used_wght_addr_per_pe: usize,
    /// Output channels (dense: neurons) produced by one filter group
    pub filters_per_pass: usize,
    /// Weight entries per scratchpad column: one per output, rounded up to
    /// whole transmission words
    pub wght_column: usize,

    pub iact_transmissions_per_pe: usize,
    pub wght_transmissions_per_pe: usize,
    pub psum_transmissions_per_pe: usize,
    pub needed_total_transmissions: usize,

    pub used_x_cluster: usize,
    pub used_y_cluster: usize,
    pub cluster_groups: usize,
    /// Output positions assigned per refresh
    pub slots_per_refresh: usize,
    /// Activation writes per router per refresh
    pub needed_iact_writes: usize,

    /// Spatial refreshes covering the whole output map
    pub refreshes_per_map: usize,
    pub used_refreshes: usize,
    /// One entry per repetition
    pub refresh_ranges: Vec<RefreshRange>,

    pub add_up: usize,
    pub padded_width: usize,
    /// Padding before the first (row, column)
    pub kernel_pad: (usize, usize),
    pub psum_delay: usize,

    pub computing_mask: ComputingMask,
    pub router_codes: RouterCodes,
}

impl TilingPlan {
    pub fn repetition(&self, r: usize) -> RepetitionIndex {
        let iact = self.iact_transmissions_per_pe;
        let wght = self.wght_transmissions_per_pe;
        RepetitionIndex {
            channel_group: r % iact,
            filter_group: (r / iact) % wght,
            window: r / (iact * wght),
        }
    }

    /// Input channels (dense: neurons) consumed by repetition `r`
    pub fn channel_range(&self, r: usize) -> Range<usize> {
        let start = self.repetition(r).channel_group * self.channels_per_pass;
        start..(start + self.channels_per_pass).min(self.shape.in_channels)
    }

    /// Output channels (dense: neurons) produced by repetition `r`
    pub fn filter_range(&self, r: usize) -> Range<usize> {
        let index = self.repetition(r);
        let group = match self.shape.kind {
            LayerKind::Conv => index.filter_group,
            LayerKind::DepthwiseConv => index.channel_group,
            LayerKind::Dense => index.window,
        };
        let start = group * self.filters_per_pass;
        start..(start + self.filters_per_pass).min(self.shape.filters)
    }

    /// True when the partial sums are complete after repetition `r`
    pub fn captures_output(&self, r: usize) -> bool {
        match self.shape.kind {
            LayerKind::DepthwiseConv => true,
            LayerKind::Conv | LayerKind::Dense => {
                self.repetition(r).channel_group == self.iact_transmissions_per_pe - 1
            }
        }
    }

    /// True when repetition `r` starts a fresh accumulation
    pub fn loads_bias(&self, r: usize) -> bool {
        match self.shape.kind {
            LayerKind::DepthwiseConv => true,
            LayerKind::Conv | LayerKind::Dense => self.repetition(r).channel_group == 0,
        }
    }

    /// True when repetition `r` uses the same weights as `r - 1`
    pub fn reuses_weights(&self, r: usize) -> bool {
        if r == 0 {
            return false;
        }
        let (now, before) = (self.repetition(r), self.repetition(r - 1));
        now.channel_group == before.channel_group && now.filter_group == before.filter_group
    }

    /// Spatial refresh indices handled by repetition `r`
    pub fn spatial_refreshes(&self, r: usize) -> Range<usize> {
        let range = self.refresh_ranges[r];
        match self.shape.kind {
            LayerKind::Dense => range.start..range.end,
            LayerKind::Conv | LayerKind::DepthwiseConv => {
                range.start / self.used_y_cluster..range.end / self.used_y_cluster
            }
        }
    }

    /// Base output position of the slot block of (group, cluster column) in
    /// a refresh
    pub fn slot_base(&self, config: &AcceleratorConfig, refresh: usize, group: usize, cl_x: usize) -> usize {
        refresh * self.slots_per_refresh + (group * config.cluster_cols + cl_x) * config.pe_cols
    }

    /// Output (y, x) computed by PE column `pe_x`, if it is a real position
    pub fn output_coord(
        &self,
        config: &AcceleratorConfig,
        refresh: usize,
        group: usize,
        cl_x: usize,
        pe_x: usize,
    ) -> Option<(usize, usize)> {
        let pos = self.slot_base(config, refresh, group, cl_x) + pe_x;
        let x = pos % self.padded_width;
        let y = pos / self.padded_width;
        (x < self.shape.out_width() && y < self.shape.out_height()).then_some((y, x))
    }

    /// Address and data words one activation scratchpad image occupies
    pub fn iact_image_words(&self, config: &AcceleratorConfig) -> (usize, usize) {
        (
            self.used_iact_addr_per_pe.div_ceil(Port::Iact.addrs_per_trans(config)),
            self.line_occupancy.div_ceil(Port::Iact.values_per_trans(config)),
        )
    }

    /// Address and data words one weight scratchpad image occupies
    pub fn wght_image_words(&self, config: &AcceleratorConfig) -> (usize, usize) {
        (
            self.used_wght_addr_per_pe.div_ceil(Port::Wght.addrs_per_trans(config)),
            self.used_wght_per_pe.div_ceil(Port::Wght.values_per_trans(config)),
        )
    }

    /// Partial-sum words per output slot
    pub fn psum_words_per_slot(&self, config: &AcceleratorConfig) -> usize {
        self.used_psum_per_pe.div_ceil(Port::Psum.values_per_trans(config))
    }

    /// Output slots of repetition `r` in stream order
    ///
    /// Each slot is one psum lane during one refresh; it carries
    /// `used_psum_per_pe` consecutive output channels starting at
    /// `first_filter`. Filters past the layer's last filter and slots without
    /// a position are padding.
    pub fn psum_slots(&self, config: &AcceleratorConfig, r: usize) -> Vec<PsumSlot> {
        let mut slots = Vec::new();
        match self.shape.kind {
            LayerKind::Dense => {
                let base = self.filter_range(r).start;
                let window = self.repetition(r).window;
                for cl_x in 0..config.cluster_cols {
                    for cl_y in 0..config.cluster_rows {
                        let cluster = cl_y * config.cluster_cols + cl_x;
                        slots.push(PsumSlot {
                            lane: Port::Psum.lane(config, cl_x, cl_y, 0),
                            cl_x,
                            cl_y,
                            pe_x: 0,
                            refresh: window,
                            first_filter: base + cluster * self.used_psum_per_pe,
                            position: Some((0, 0)),
                        });
                    }
                }
            }
            LayerKind::Conv | LayerKind::DepthwiseConv => {
                let first_filter = self.filter_range(r).start;
                let routers = config.psum_routers.min(config.pe_cols);
                for refresh in self.spatial_refreshes(r) {
                    for group in 0..self.cluster_groups {
                        let cl_y = group * self.used_y_cluster;
                        for cl_x in 0..config.cluster_cols {
                            for router in 0..routers {
                                if !self.computing_mask.pe_col_active(cl_x, cl_y, router) {
                                    continue;
                                }
                                slots.push(PsumSlot {
                                    lane: Port::Psum.lane(config, cl_x, cl_y, router),
                                    cl_x,
                                    cl_y,
                                    pe_x: router,
                                    refresh,
                                    first_filter,
                                    position: self.output_coord(config, refresh, group, cl_x, router),
                                });
                            }
                        }
                    }
                }
            }
        }
        slots
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for TilingPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Tiling Plan")?;
        writeln!(f, "===========")?;
        writeln!(f, "Layer: {}", self.shape)?;
        writeln!(
            f,
            "Occupancy per PE: {} iact, {} wght, {} psum",
            self.used_iact_per_pe, self.used_wght_per_pe, self.used_psum_per_pe
        )?;
        writeln!(
            f,
            "Transmissions: {} iact x {} wght x {} psum = {}",
            self.iact_transmissions_per_pe,
            self.wght_transmissions_per_pe,
            self.psum_transmissions_per_pe,
            self.needed_total_transmissions
        )?;
        writeln!(
            f,
            "Clusters: {} used columns, {} rows per group, {} groups",
            self.used_x_cluster, self.used_y_cluster, self.cluster_groups
        )?;
        writeln!(
            f,
            "Refreshes: {} ({} per map), add_up {}",
            self.used_refreshes, self.refreshes_per_map, self.add_up
        )?;
        writeln!(f, "Active PEs: {}", self.computing_mask.active_count())?;
        Ok(())
    }
}

/// Plans layers for one accelerator instance
pub struct GeometryPlanner {
    config: AcceleratorConfig,
}

impl GeometryPlanner {
    pub fn new(config: AcceleratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    /// Compute the tiling plan of one layer
    pub fn plan(&self, shape: &LayerShape) -> MapResult<TilingPlan> {
        shape.validate()?;
        let plan = match shape.kind {
            LayerKind::Conv | LayerKind::DepthwiseConv => self.plan_spatial(shape)?,
            LayerKind::Dense => self.plan_dense(shape)?,
        };
        debug!(
            layer = %shape,
            repetitions = plan.needed_total_transmissions,
            active_pes = plan.computing_mask.active_count(),
            "planned layer"
        );
        Ok(plan)
    }

    fn plan_spatial(&self, shape: &LayerShape) -> MapResult<TilingPlan> {
        let c = &self.config;
        let (kh, kw) = (shape.kernel_height, shape.kernel_width);

        let row_limit = c.pe_rows * c.cluster_rows;
        if kh > row_limit {
            return Err(MapError::planning("kernel_height", kh, row_limit));
        }
        if kw > c.iacts_per_pe {
            return Err(MapError::planning("kernel_width", kw, c.iacts_per_pe));
        }
        let line_limit = c.iacts_per_pe.min(max_unsigned(c.iact_addr_bits));
        if kh > line_limit {
            return Err(MapError::planning("kernel_height", kh, line_limit));
        }

        let used_y = kh.div_ceil(c.pe_rows);
        let groups = c.cluster_rows / used_y;

        let used_channels = match shape.kind {
            LayerKind::DepthwiseConv => 1,
            _ => channels_for_kernel_width(kw)
                .ok_or(MapError::UnsupportedKernel { width: kw })?
                .min(shape.in_channels)
                .min(c.iact_addr_per_pe)
                .min(c.iacts_per_pe / kw.max(kh))
                .min(line_limit / kh),
        };
        if used_channels == 0 {
            return Err(MapError::planning("iact_addr_per_pe", 1, c.iact_addr_per_pe));
        }
        let used_wght_addr = kw * used_channels;
        if used_wght_addr > c.wght_addr_per_pe {
            return Err(MapError::planning(
                "kernel_width",
                kw,
                c.wght_addr_per_pe / used_channels,
            ));
        }

        let used_iact = kw * used_channels;
        let iact_tx = shape.in_channels.div_ceil(used_channels);
        let wght_per_word = Port::Wght.values_per_trans(c);
        let (filters_per_pass, wght_tx) = match shape.kind {
            LayerKind::DepthwiseConv => (1, 1),
            _ => self.split_filters(shape.filters, used_iact)?,
        };
        let wght_column = filters_per_pass.next_multiple_of(wght_per_word);
        if wght_column * used_iact > c.wghts_per_pe {
            return Err(MapError::planning("weights per PE", wght_column * used_iact, c.wghts_per_pe));
        }

        let out_w = shape.out_width();
        let add_up = add_up_for(out_w, c.pe_cols)?;
        let padded_width = out_w + add_up;
        let slots = groups * c.cluster_cols * c.pe_cols;
        if add_up > 0 && slots % padded_width != 0 {
            return Err(MapError::UnsupportedOutputWidth {
                width: out_w,
                pe_cols: c.pe_cols,
            });
        }

        let mut mask = ComputingMask::full(c);
        for cl_x in 0..c.cluster_cols {
            for cl_y in 0..c.cluster_rows {
                let group = cl_y / used_y;
                let row_base = (cl_y % used_y) * c.pe_rows;
                for pe_y in 0..c.pe_rows {
                    for pe_x in 0..c.pe_cols {
                        let slot = (group * c.cluster_cols + cl_x) * c.pe_cols + pe_x;
                        let active = group < groups && row_base + pe_y < kh && slot % padded_width < out_w;
                        mask.set(cl_x, cl_y, pe_y, pe_x, active);
                    }
                }
            }
        }

        let needed_iact_writes = ((c.pe_cols - 1) * shape.stride_x + kw).div_ceil(c.iact_routers);
        let refreshes_per_map = (shape.out_height() * padded_width).div_ceil(slots);

        let line_words = used_channels.div_ceil(Port::Iact.addrs_per_trans(c))
            + (kh * used_channels).div_ceil(Port::Iact.values_per_trans(c));
        let limits = [
            (
                "psum words per refresh",
                filters_per_pass.div_ceil(Port::Psum.values_per_trans(c)),
                c.psum_mem_words,
            ),
            ("iact words per refresh", needed_iact_writes * line_words, c.iact_mem_words),
            ("needed_refreshes", used_y, max_unsigned(NEEDED_REFRESHES_BITS)),
        ];
        let mut per_window = refreshes_per_map;
        for (dimension, need, capacity) in limits {
            if need > capacity {
                return Err(MapError::planning(dimension, need, capacity));
            }
            per_window = per_window.min(capacity / need);
        }
        let psum_tx = refreshes_per_map.div_ceil(per_window);

        let windows: Vec<RefreshRange> = (0..psum_tx)
            .map(|k| {
                let first = k * refreshes_per_map / psum_tx;
                let last = (k + 1) * refreshes_per_map / psum_tx;
                RefreshRange {
                    count: (last - first) * used_y,
                    start: first * used_y,
                    end: last * used_y,
                }
            })
            .collect();
        let total = iact_tx * wght_tx * psum_tx;
        let refresh_ranges = (0..total).map(|r| windows[r / (iact_tx * wght_tx)]).collect();

        Ok(TilingPlan {
            shape: shape.clone(),
            used_channels,
            channels_per_pass: used_channels,
            line_occupancy: kh * used_channels,
            used_iact_per_pe: used_iact,
            used_wght_per_pe: wght_column * used_iact,
            used_psum_per_pe: filters_per_pass,
            used_iact_addr_per_pe: used_channels,
            used_wght_addr_per_pe: used_wght_addr,
            filters_per_pass,
            wght_column,
            iact_transmissions_per_pe: iact_tx,
            wght_transmissions_per_pe: wght_tx,
            psum_transmissions_per_pe: psum_tx,
            needed_total_transmissions: total,
            used_x_cluster: c.cluster_cols,
            used_y_cluster: used_y,
            cluster_groups: groups,
            slots_per_refresh: slots,
            needed_iact_writes,
            refreshes_per_map,
            used_refreshes: used_y * refreshes_per_map,
            refresh_ranges,
            add_up,
            padded_width,
            kernel_pad: shape.kernel_pad(),
            psum_delay: (filters_per_pass / 2).saturating_sub(2 + used_y * c.pe_rows * 2),
            computing_mask: mask,
            router_codes: RouterCodes::build(c, shape.kind, used_y, groups),
        })
    }

    /// Split filters into groups whose weights and partial sums fit one PE
    fn split_filters(&self, filters: usize, used_iact: usize) -> MapResult<(usize, usize)> {
        let c = &self.config;
        let per_word = Port::Wght.values_per_trans(c);
        if per_word * used_iact > c.wghts_per_pe {
            return Err(MapError::planning("weights per filter", used_iact, c.wghts_per_pe / per_word));
        }
        let mut wght_tx = (filters * used_iact).div_ceil(c.wghts_per_pe).max(1);
        loop {
            let per_pass = filters.div_ceil(wght_tx);
            let column = per_pass.next_multiple_of(per_word);
            if column * used_iact <= c.wghts_per_pe && per_pass <= c.psums_per_pe {
                return Ok((per_pass, wght_tx));
            }
            wght_tx += 1;
        }
    }

    fn plan_dense(&self, shape: &LayerShape) -> MapResult<TilingPlan> {
        let c = &self.config;
        let inputs = shape.in_channels;
        let outputs = shape.filters;
        let clusters = c.num_clusters();

        let used_iact = DENSE_IACTS_PER_PE
            .min(c.iacts_per_pe)
            .min(max_unsigned(c.iact_addr_bits))
            .min(inputs.div_ceil(c.pe_rows));
        let wght_per_word = Port::Wght.values_per_trans(c);
        let used_psum = DENSE_PSUMS_PER_PE
            .min(c.psums_per_pe)
            .min(c.wghts_per_pe / used_iact / wght_per_word * wght_per_word)
            .min(outputs.div_ceil(clusters));
        if used_psum == 0 {
            return Err(MapError::planning("weights per input", used_iact, c.wghts_per_pe));
        }
        let wght_column = used_psum.next_multiple_of(wght_per_word);
        if used_iact > c.wght_addr_per_pe {
            return Err(MapError::planning("inputs per PE", used_iact, c.wght_addr_per_pe));
        }

        let channels_per_pass = used_iact * c.pe_rows;
        let filters_per_pass = used_psum * clusters;
        let iact_tx = inputs.div_ceil(channels_per_pass);
        let psum_tx = outputs.div_ceil(filters_per_pass);
        let total = iact_tx * psum_tx;

        let mut mask = ComputingMask::full(c);
        for cl_x in 0..c.cluster_cols {
            for cl_y in 0..c.cluster_rows {
                for pe_y in 0..c.pe_rows {
                    for pe_x in 1..c.pe_cols {
                        mask.set(cl_x, cl_y, pe_y, pe_x, false);
                    }
                }
            }
        }

        let refresh_ranges = (0..total)
            .map(|r| {
                let group = r / iact_tx;
                RefreshRange {
                    count: 1,
                    start: group,
                    end: group + 1,
                }
            })
            .collect();

        Ok(TilingPlan {
            shape: shape.clone(),
            used_channels: used_iact,
            channels_per_pass,
            line_occupancy: used_iact,
            used_iact_per_pe: used_iact,
            used_wght_per_pe: used_iact * wght_column,
            used_psum_per_pe: used_psum,
            used_iact_addr_per_pe: 1,
            used_wght_addr_per_pe: used_iact,
            filters_per_pass,
            wght_column,
            iact_transmissions_per_pe: iact_tx,
            wght_transmissions_per_pe: 1,
            psum_transmissions_per_pe: psum_tx,
            needed_total_transmissions: total,
            used_x_cluster: c.cluster_cols,
            used_y_cluster: c.cluster_rows,
            cluster_groups: 1,
            slots_per_refresh: clusters,
            needed_iact_writes: c.pe_rows.div_ceil(c.iact_routers),
            refreshes_per_map: 1,
            used_refreshes: psum_tx,
            refresh_ranges,
            add_up: 0,
            padded_width: 1,
            kernel_pad: (0, 0),
            psum_delay: (used_psum / 2).saturating_sub(2 + c.cluster_rows * c.pe_rows * 2),
            computing_mask: mask,
            router_codes: RouterCodes::build(c, LayerKind::Dense, c.cluster_rows, 1),
        })
    }
}

fn max_unsigned(bits: u32) -> usize {
    (1usize << bits) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Padding;
    use std::collections::HashSet;

    fn planner() -> GeometryPlanner {
        GeometryPlanner::new(AcceleratorConfig::default())
    }

    fn sample_layers() -> Vec<LayerShape> {
        vec![
            LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same),
            LayerShape::conv(16, 16, 16, 40, (3, 3), (1, 1), Padding::Same),
            LayerShape::conv(28, 28, 1, 8, (5, 5), (1, 1), Padding::Same),
            LayerShape::conv(7, 7, 3, 4, (3, 3), (1, 1), Padding::Same),
            LayerShape::conv(14, 14, 2, 2, (1, 1), (1, 1), Padding::Same),
            LayerShape::conv(12, 12, 1, 1, (9, 9), (1, 1), Padding::Valid),
            LayerShape::conv(8, 8, 2, 4, (3, 3), (2, 2), Padding::Same),
            LayerShape::depthwise(8, 8, 6, (3, 3), (1, 1), Padding::Same),
            LayerShape::depthwise(13, 13, 2, (3, 3), (1, 1), Padding::Same),
            LayerShape::dense(64, 10),
            LayerShape::dense(500, 300),
        ]
    }

    #[test]
    fn test_occupancy_within_scratchpads() {
        let config = AcceleratorConfig::default();
        for shape in sample_layers() {
            let plan = planner().plan(&shape).unwrap();
            assert!(plan.used_iact_per_pe <= config.iacts_per_pe, "{}", shape);
            assert!(plan.line_occupancy <= config.iacts_per_pe, "{}", shape);
            assert!(plan.used_wght_per_pe <= config.wghts_per_pe, "{}", shape);
            assert!(plan.used_psum_per_pe <= config.psums_per_pe, "{}", shape);
            assert!(plan.used_iact_addr_per_pe <= config.iact_addr_per_pe, "{}", shape);
            assert!(plan.used_wght_addr_per_pe <= config.wght_addr_per_pe, "{}", shape);
            assert_eq!(
                plan.needed_total_transmissions,
                plan.iact_transmissions_per_pe * plan.wght_transmissions_per_pe * plan.psum_transmissions_per_pe
            );
            assert_eq!(plan.refresh_ranges.len(), plan.needed_total_transmissions);
        }
    }

    #[test]
    fn test_needed_refreshes_fit_status_field() {
        let cap = max_unsigned(NEEDED_REFRESHES_BITS);
        let mut shapes = sample_layers();
        shapes.push(LayerShape::conv(96, 96, 1, 2, (3, 3), (1, 1), Padding::Same));
        shapes.push(LayerShape::conv(12, 12, 1, 2, (5, 5), (1, 1), Padding::Same));
        for shape in shapes {
            let plan = planner().plan(&shape).unwrap();
            assert!(plan.refresh_ranges.iter().all(|r| r.count <= cap), "{}", shape);
        }
    }

    #[test]
    fn test_mask_cardinality() {
        let config = AcceleratorConfig::default();
        for shape in sample_layers() {
            let plan = planner().plan(&shape).unwrap();
            assert_eq!(
                plan.computing_mask.active_count(),
                expected_active_pes(&config, &shape).unwrap(),
                "{}",
                shape
            );
        }
    }

    #[test]
    fn test_default_conv_plan() {
        let shape = LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same);
        let plan = planner().plan(&shape).unwrap();
        assert_eq!(plan.used_y_cluster, 1);
        assert_eq!(plan.cluster_groups, 8);
        assert_eq!(plan.used_channels, 4);
        assert_eq!(plan.used_iact_per_pe, 12);
        assert_eq!(plan.used_wght_per_pe, 96);
        assert_eq!(plan.needed_iact_writes, 2);
        assert_eq!(plan.slots_per_refresh, 64);
        assert_eq!(plan.refreshes_per_map, 1);
        assert_eq!(plan.needed_total_transmissions, 1);
        assert_eq!(plan.computing_mask.active_count(), 192);
    }

    #[test]
    fn test_channel_and_filter_split() {
        let shape = LayerShape::conv(16, 16, 16, 40, (3, 3), (1, 1), Padding::Same);
        let plan = planner().plan(&shape).unwrap();
        assert_eq!(plan.iact_transmissions_per_pe, 4);
        assert_eq!(plan.wght_transmissions_per_pe, 3);
        assert_eq!(plan.filters_per_pass, 14);
        assert_eq!(plan.filter_range(4), 14..28);
        assert_eq!(plan.filter_range(11), 28..40);
        assert_eq!(plan.channel_range(6), 8..12);
        assert!(plan.captures_output(3));
        assert!(!plan.captures_output(4));
        assert!(plan.loads_bias(4));
    }

    #[test]
    fn test_tall_kernel_uses_cluster_groups() {
        let shape = LayerShape::conv(12, 12, 1, 1, (9, 9), (1, 1), Padding::Valid);
        let plan = planner().plan(&shape).unwrap();
        assert_eq!(plan.used_y_cluster, 3);
        assert_eq!(plan.cluster_groups, 2);
        assert!(!plan.computing_mask.cluster_active(0, 6));
        assert!(plan.computing_mask.cluster_active(1, 5));
        assert_eq!(plan.used_refreshes % plan.used_y_cluster, 0);
    }

    #[test]
    fn test_add_up_masks_trailing_columns() {
        let shape = LayerShape::conv(7, 7, 3, 4, (3, 3), (1, 1), Padding::Same);
        let plan = planner().plan(&shape).unwrap();
        assert_eq!(plan.add_up, 1);
        assert_eq!(plan.padded_width, 8);
        assert!(plan.computing_mask.get(0, 0, 0, 3));
        assert!(!plan.computing_mask.get(1, 0, 0, 3));
        assert!(!plan.computing_mask.get(1, 7, 2, 3));
        assert_eq!(plan.output_coord(&AcceleratorConfig::default(), 0, 0, 1, 3), None);
    }

    #[test]
    fn test_add_up_policy_table() {
        assert_eq!(add_up_for(8, 4).unwrap(), 0);
        assert_eq!(add_up_for(5, 4).unwrap(), 3);
        assert_eq!(add_up_for(13, 4).unwrap(), 3);
        assert!(add_up_for(10, 4).is_err());
        assert!(add_up_for(17, 4).is_err());
    }

    #[test]
    fn test_partition_completeness() {
        let config = AcceleratorConfig::default();
        let shapes = vec![
            LayerShape::conv(96, 96, 1, 4, (3, 3), (1, 1), Padding::Same),
            LayerShape::conv(32, 32, 3, 2, (9, 9), (1, 1), Padding::Same),
            LayerShape::depthwise(96, 96, 2, (3, 3), (1, 1), Padding::Same),
        ];
        for shape in shapes {
            let plan = planner().plan(&shape).unwrap();
            assert!(plan.psum_transmissions_per_pe > 1, "{}", shape);

            let per_window = plan.iact_transmissions_per_pe * plan.wght_transmissions_per_pe;
            let mut seen = HashSet::new();
            for r in (0..plan.needed_total_transmissions).step_by(per_window) {
                let range = plan.refresh_ranges[r];
                assert_eq!(range.start % plan.used_y_cluster, 0);
                assert_eq!(range.count, range.end - range.start);
                for refresh in plan.spatial_refreshes(r) {
                    for group in 0..plan.cluster_groups {
                        for cl_x in 0..config.cluster_cols {
                            for pe_x in 0..config.pe_cols {
                                if let Some(coord) = plan.output_coord(&config, refresh, group, cl_x, pe_x) {
                                    assert!(seen.insert(coord), "{:?} covered twice", coord);
                                }
                            }
                        }
                    }
                }
            }
            assert_eq!(seen.len(), shape.output_positions(), "{}", shape);
        }
    }

    #[test]
    fn test_windows_shared_across_channel_groups() {
        let shape = LayerShape::conv(64, 64, 8, 4, (3, 3), (1, 1), Padding::Same);
        let plan = planner().plan(&shape).unwrap();
        assert_eq!(plan.iact_transmissions_per_pe, 2);
        assert_eq!(plan.refresh_ranges[0], plan.refresh_ranges[1]);
        assert_ne!(plan.refresh_ranges[1], plan.refresh_ranges[2]);
        assert!(!plan.reuses_weights(0));
        assert!(!plan.reuses_weights(1));
        assert!(!plan.reuses_weights(2));

        let single = LayerShape::conv(96, 96, 1, 4, (3, 3), (1, 1), Padding::Same);
        let plan = planner().plan(&single).unwrap();
        assert_eq!(plan.psum_transmissions_per_pe, 2);
        assert!(plan.reuses_weights(1));
    }

    #[test]
    fn test_fatal_rejection_of_tall_kernel() {
        let config = AcceleratorConfig::default();
        let kh = config.pe_rows * config.cluster_rows + 1;
        let shape = LayerShape::conv(32, 32, 1, 1, (kh, 3), (1, 1), Padding::Same);
        let err = planner().plan(&shape).unwrap_err();
        assert!(err.is_planning());
        assert!(matches!(
            err,
            MapError::PlanningError { ref dimension, value: 25, limit: 24 } if dimension == "kernel_height"
        ));
    }

    #[test]
    fn test_unsupported_kernel_width() {
        let shape = LayerShape::conv(8, 8, 1, 1, (3, 4), (1, 1), Padding::Same);
        assert!(matches!(
            planner().plan(&shape),
            Err(MapError::UnsupportedKernel { width: 4 })
        ));
    }

    #[test]
    fn test_dense_plan() {
        let plan = planner().plan(&LayerShape::dense(500, 300)).unwrap();
        assert_eq!(plan.used_iact_per_pe, 12);
        assert_eq!(plan.used_psum_per_pe, 16);
        assert_eq!(plan.channels_per_pass, 36);
        assert_eq!(plan.iact_transmissions_per_pe, 14);
        assert_eq!(plan.psum_transmissions_per_pe, 2);
        assert_eq!(plan.filter_range(14), 256..300);
        assert_eq!(plan.refresh_ranges[14].start, 1);
        assert_eq!(plan.computing_mask.active_count(), 48);
    }

    #[test]
    fn test_depthwise_plan() {
        let shape = LayerShape::depthwise(8, 8, 6, (3, 3), (1, 1), Padding::Same);
        let plan = planner().plan(&shape).unwrap();
        assert_eq!(plan.used_iact_per_pe, 3);
        assert_eq!(plan.wght_column, 2);
        assert_eq!(plan.used_wght_per_pe, 6);
        assert_eq!(plan.iact_transmissions_per_pe, 6);
        assert_eq!(plan.filter_range(4), 4..5);
        assert!(plan.captures_output(0));
    }
}
