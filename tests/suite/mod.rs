mod control_plane;
mod socket;
