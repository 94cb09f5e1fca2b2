/// Linear identifier of a zone: `y * grid_size + x`.
pub type ZoneId = u32;

pub const DEFAULT_GRID_SIZE: u32 = 64;
pub const DEFAULT_TILES_PER_ZONE: u32 = 32;

/// Spatial index of the world: a square grid of zones, each covering a
/// square block of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneIndex {
    grid_size: u32,
    tiles_per_zone: u32,
}

impl Default for ZoneIndex {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_SIZE, DEFAULT_TILES_PER_ZONE)
    }
}

impl ZoneIndex {
    pub fn new(grid_size: u32, tiles_per_zone: u32) -> Self {
        Self {
            grid_size: grid_size.max(1),
            tiles_per_zone: tiles_per_zone.max(1),
        }
    }

    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    pub fn zone_count(&self) -> u32 {
        self.grid_size * self.grid_size
    }

    pub fn to_coordinate(&self, zone_id: ZoneId) -> (u32, u32) {
        debug_assert!(zone_id < self.zone_count(), "zone id {zone_id} outside grid");
        (zone_id % self.grid_size, zone_id / self.grid_size)
    }

    pub fn to_zone_id(&self, x: u32, y: u32) -> ZoneId {
        debug_assert!(
            x < self.grid_size && y < self.grid_size,
            "zone ({x}, {y}) outside grid"
        );
        y * self.grid_size + x
    }

    /// Zone containing a tile; tiles past the edge clamp to the last zone.
    pub fn zone_of_tile(&self, tile_x: u32, tile_y: u32) -> (u32, u32) {
        let last = self.grid_size - 1;
        (
            (tile_x / self.tiles_per_zone).min(last),
            (tile_y / self.tiles_per_zone).min(last),
        )
    }

    /// Chebyshev distance in zones between `zone_id` and the center zone.
    pub fn distance(&self, zone_id: ZoneId, center_x: u32, center_y: u32) -> u32 {
        let (x, y) = self.to_coordinate(zone_id);
        x.abs_diff(center_x).max(y.abs_diff(center_y))
    }

    /// All zones within `radius` of the center, clipped to the grid, row-major.
    pub fn zones_within_radius(&self, center_x: u32, center_y: u32, radius: u32) -> Vec<ZoneId> {
        let last = self.grid_size - 1;
        if center_x > last || center_y > last {
            return Vec::new();
        }
        let min_x = center_x.saturating_sub(radius);
        let max_x = center_x.saturating_add(radius).min(last);
        let min_y = center_y.saturating_sub(radius);
        let max_y = center_y.saturating_add(radius).min(last);

        let mut zones =
            Vec::with_capacity(((max_x - min_x + 1) * (max_y - min_y + 1)) as usize);
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                zones.push(self.to_zone_id(x, y));
            }
        }
        zones
    }
}
